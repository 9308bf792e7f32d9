use std::fmt;
use std::process::ExitCode;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sunrs_solver::ls::{JacFn, LsStats, RhsFn, Scratch};
use sunrs_solver::nvector::{ThreadedConfig, ThreadedContext};
use sunrs_solver::{
    BandLu, BandMatrix, CallbackError, CallbackResult, ConvergenceFailure, DenseLu, DenseMatrix,
    JacobianSource, KrylovConfig, LinearSolver, LinearSolverInterface, LsError, NVector, Package,
    Real, SerialVector, SetupRequest, SolveRequest, SparseFormat, SparseLu, SparseMatrix, Spgmr,
    SunMatrix, SystemState, ThreadedVector,
};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

const RTOL: Real = 1e-4;
const ATOL: Real = 1e-8;
const NEWTON_TOL: Real = 0.1;
const MAX_NEWTON: usize = 10;
const MAX_ATTEMPTS: usize = 3;

fn usage() {
    eprintln!(
        "usage: sunrs-cli robertson [--solver dense|band|sparse|gmres] [--backend serial|threaded]\n\
         \x20                        [--t-end T] [--steps N] [--msbj N] [--json]"
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum SolverChoice {
    Dense,
    Band,
    Sparse,
    Gmres,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Backend {
    Serial,
    Threaded,
}

#[derive(Debug, Clone)]
struct Options {
    solver: SolverChoice,
    backend: Backend,
    t_end: Real,
    steps: usize,
    msbj: usize,
    json: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            solver: SolverChoice::Dense,
            backend: Backend::Serial,
            t_end: 0.4,
            steps: 400,
            msbj: 0,
            json: false,
        }
    }
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let mut value = |name: &str| {
            iter.next()
                .cloned()
                .ok_or_else(|| format!("{name} needs a value"))
        };
        match arg.as_str() {
            "--solver" => {
                opts.solver = match value("--solver")?.as_str() {
                    "dense" => SolverChoice::Dense,
                    "band" => SolverChoice::Band,
                    "sparse" => SolverChoice::Sparse,
                    "gmres" => SolverChoice::Gmres,
                    other => return Err(format!("unknown solver '{other}'")),
                }
            }
            "--backend" => {
                opts.backend = match value("--backend")?.as_str() {
                    "serial" => Backend::Serial,
                    "threaded" => Backend::Threaded,
                    other => return Err(format!("unknown backend '{other}'")),
                }
            }
            "--t-end" => {
                opts.t_end = value("--t-end")?
                    .parse()
                    .map_err(|e| format!("--t-end: {e}"))?;
                if !(opts.t_end > 0.0) {
                    return Err("--t-end must be positive".into());
                }
            }
            "--steps" => {
                opts.steps = value("--steps")?
                    .parse()
                    .map_err(|e| format!("--steps: {e}"))?;
                if opts.steps == 0 {
                    return Err("--steps must be positive".into());
                }
            }
            "--msbj" => {
                opts.msbj = value("--msbj")?
                    .parse()
                    .map_err(|e| format!("--msbj: {e}"))?;
            }
            "--json" => opts.json = true,
            other => return Err(format!("unknown option '{other}'")),
        }
    }
    Ok(opts)
}

#[derive(Debug)]
enum RunError {
    Solver(LsError),
    Backend(String),
    NewtonFailed { t: Real },
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::Solver(e) => write!(f, "linear solver interface: {e}"),
            RunError::Backend(msg) => write!(f, "vector backend: {msg}"),
            RunError::NewtonFailed { t } => write!(f, "Newton iteration failed at t = {t:.6e}"),
        }
    }
}

impl From<LsError> for RunError {
    fn from(e: LsError) -> Self {
        RunError::Solver(e)
    }
}

#[derive(Debug, Serialize)]
struct Report {
    problem: &'static str,
    solver: SolverChoice,
    backend: Backend,
    started_at: DateTime<Utc>,
    elapsed_ms: f64,
    t_end: Real,
    step: Real,
    y: Vec<Real>,
    newton_iters: usize,
    convergence_failures: usize,
    stats: LsStats,
}

struct Outcome {
    y: Vec<Real>,
    newton_iters: usize,
    convergence_failures: usize,
    stats: LsStats,
}

/// `y1' = -0.04 y1 + 1e4 y2 y3`, `y3' = 3e7 y2^2`, `y1 + y2 + y3 = 1`.
fn robertson(y: &[Real], f: &mut [Real]) {
    f[0] = -0.04 * y[0] + 1.0e4 * y[1] * y[2];
    f[2] = 3.0e7 * y[1] * y[1];
    f[1] = -f[0] - f[2];
}

fn host_err() -> CallbackError {
    CallbackError::unrecoverable()
}

fn rhs_fn<V: NVector>() -> RhsFn<'static, V> {
    Box::new(|_t: Real, y: &V, f: &mut V| -> CallbackResult {
        robertson(y.as_slice().ok_or_else(host_err)?, f.as_mut_slice().ok_or_else(host_err)?);
        Ok(())
    })
}

/// Analytic Jacobian assembled into compressed sparse columns.
fn sparse_jacobian<V: NVector>() -> JacFn<'static, V> {
    Box::new(
        |state: &SystemState<'_, V>, m: &mut dyn SunMatrix, _scratch: &mut Scratch<V>| -> CallbackResult {
            let y = state.y.as_slice().ok_or_else(host_err)?;
            let triplets = [
                (0, 0, -0.04),
                (1, 0, 0.04),
                (0, 1, 1.0e4 * y[2]),
                (1, 1, -1.0e4 * y[2] - 6.0e7 * y[1]),
                (2, 1, 6.0e7 * y[1]),
                (0, 2, 1.0e4 * y[1]),
                (1, 2, -1.0e4 * y[1]),
                (2, 2, 0.0),
            ];
            let s = m.downcast_mut::<SparseMatrix>().ok_or_else(host_err)?;
            *s = SparseMatrix::from_triplets(3, 3, &triplets, SparseFormat::Csc)
                .map_err(|_| host_err())?;
            Ok(())
        },
    )
}

fn set_weights<V: NVector>(y: &V, w: &mut V) -> Result<(), RunError> {
    let (Some(ys), Some(ws)) = (y.as_slice(), w.as_mut_slice()) else {
        return Err(RunError::Backend("vector has no host data".into()));
    };
    for (wi, yi) in ws.iter_mut().zip(ys) {
        *wi = 1.0 / (RTOL * yi.abs() + ATOL);
    }
    Ok(())
}

fn backend_err<E: fmt::Display>(e: E) -> RunError {
    RunError::Backend(e.to_string())
}

/// Backward Euler with a modified Newton iteration seeded by an explicit
/// Euler predictor.
fn backward_euler<'a, V: NVector>(
    template: &V,
    ls: &'a mut dyn LinearSolver<V>,
    matrix: Option<&'a mut dyn SunMatrix>,
    opts: &Options,
    jacobian: Option<JacFn<'a, V>>,
) -> Result<Outcome, RunError> {
    let h = opts.t_end / opts.steps as Real;
    let mut y = template.clone_empty();
    y.as_mut_slice()
        .ok_or_else(|| RunError::Backend("vector has no host data".into()))?
        .copy_from_slice(&[1.0, 0.0, 0.0]);
    let mut yn = y.clone_empty();
    let mut yp = y.clone_empty();
    let mut f = y.clone_empty();
    let mut w = y.clone_empty();
    let mut b = y.clone_empty();
    let mut eval = rhs_fn::<V>();

    let mut iface = LinearSolverInterface::attach(Package::Multistep, ls, matrix, &y)?;
    iface.set_rhs_fn(rhs_fn());
    iface.set_jac_eval_frequency(opts.msbj)?;
    if let Some(jac) = jacobian {
        iface.set_jacobian(JacobianSource::Analytic(jac))?;
    }
    info!(solver = iface.solver().id().name(), h, steps = opts.steps, "integrating");

    let mut newton_iters = 0;
    let mut convergence_failures = 0;
    for step in 1..=opts.steps {
        let t = step as Real * h;
        yn.scale(1.0, &y).map_err(backend_err)?;
        eval(t - h, &yn, &mut f).map_err(backend_err)?;
        yp.linear_sum(1.0, &yn, h, &f).map_err(backend_err)?;
        y.scale(1.0, &yp).map_err(backend_err)?;

        let mut conv_fail = ConvergenceFailure::None;
        let mut converged = false;
        for attempt in 0..MAX_ATTEMPTS {
            eval(t, &y, &mut f).map_err(backend_err)?;
            set_weights(&y, &mut w)?;
            let state = SystemState::new(t, &y, &f, &w).with_gamma(h).with_step(h);
            let mut req = SetupRequest::new(state).with_conv_fail(conv_fail);
            if attempt + 1 == MAX_ATTEMPTS {
                req = req.fresh_jacobian();
            }
            iface.setup(&req)?;

            for m in 0..MAX_NEWTON {
                eval(t, &y, &mut f).map_err(backend_err)?;
                b.linear_sum(1.0, &yn, -1.0, &y).map_err(backend_err)?;
                b.axpy(h, &f).map_err(backend_err)?;
                let state = SystemState::new(t, &y, &f, &w).with_gamma(h).with_step(h);
                let req = SolveRequest::new(state, NEWTON_TOL).with_newton_iter(m);
                match iface.solve(&mut b, &req) {
                    Ok(()) => {}
                    Err(e) if e.is_recoverable() => {
                        debug!(t, error = %e, "recoverable linear solve failure");
                        break;
                    }
                    Err(e) => return Err(e.into()),
                }
                y.axpy(1.0, &b).map_err(backend_err)?;
                newton_iters += 1;
                if b.wrms_norm(&w).map_err(backend_err)? <= NEWTON_TOL {
                    converged = true;
                    break;
                }
            }
            if converged {
                break;
            }
            convergence_failures += 1;
            conv_fail = ConvergenceFailure::BadJacobian;
            y.scale(1.0, &yp).map_err(backend_err)?;
            warn!(t, attempt, "Newton iteration did not converge, retrying");
        }
        if !converged {
            return Err(RunError::NewtonFailed { t });
        }
    }

    Ok(Outcome {
        y: y.as_slice().map(<[Real]>::to_vec).unwrap_or_default(),
        newton_iters,
        convergence_failures,
        stats: iface.stats().clone(),
    })
}

fn run_with<V: NVector>(template: &V, opts: &Options) -> Result<Outcome, RunError> {
    match opts.solver {
        SolverChoice::Dense => {
            let mut ls = DenseLu::new();
            let mut a = DenseMatrix::new(3, 3);
            backward_euler(template, &mut ls, Some(&mut a), opts, None)
        }
        SolverChoice::Band => {
            let mut ls = BandLu::new();
            let mut a = BandMatrix::new(3, 2, 2);
            backward_euler(template, &mut ls, Some(&mut a), opts, None)
        }
        SolverChoice::Sparse => {
            let mut ls = SparseLu::new();
            let mut a = SparseMatrix::new(3, 3, 9, SparseFormat::Csc);
            backward_euler(template, &mut ls, Some(&mut a), opts, Some(sparse_jacobian()))
        }
        SolverChoice::Gmres => {
            let mut ls = Spgmr::matrix_free(template, KrylovConfig::with_max_l(3));
            backward_euler(template, &mut ls, None, opts, None)
        }
    }
}

fn run(opts: &Options) -> Result<Outcome, RunError> {
    match opts.backend {
        Backend::Serial => run_with(&SerialVector::zeros(3), opts),
        Backend::Threaded => {
            let ctx = ThreadedContext::new(ThreadedConfig::default()).map_err(backend_err)?;
            run_with(&ThreadedVector::zeros(3, &ctx), opts)
        }
    }
}

fn print_report(report: &Report) {
    println!("problem: {}", report.problem);
    println!("solver: {:?}", report.solver);
    println!("backend: {:?}", report.backend);
    println!("t_end: {:.4e}  step: {:.4e}", report.t_end, report.step);
    for (i, yi) in report.y.iter().enumerate() {
        println!("y{}: {:.6e}", i + 1, yi);
    }
    println!("newton_iters: {}", report.newton_iters);
    println!("convergence_failures: {}", report.convergence_failures);
    let s = &report.stats;
    println!("nsetups: {}", s.nsetups);
    println!("nje: {}", s.nje);
    println!("nfe_dq: {}", s.nfe_dq);
    println!("nli: {}", s.nli);
    println!("njtimes: {}", s.njtimes);
    println!("ncfl: {}", s.ncfl);
    println!("last_flag: {:?}", s.last_flag());
    println!("elapsed_ms: {:.3}", report.elapsed_ms);
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 || args[1] != "robertson" {
        usage();
        return ExitCode::from(2);
    }
    let opts = match parse_args(&args[2..]) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("error: {msg}");
            usage();
            return ExitCode::from(2);
        }
    };

    let started_at = Utc::now();
    let clock = Instant::now();
    let outcome = match run(&opts) {
        Ok(outcome) => outcome,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::from(1);
        }
    };

    let report = Report {
        problem: "robertson",
        solver: opts.solver,
        backend: opts.backend,
        started_at,
        elapsed_ms: clock.elapsed().as_secs_f64() * 1e3,
        t_end: opts.t_end,
        step: opts.t_end / opts.steps as Real,
        y: outcome.y,
        newton_iters: outcome.newton_iters,
        convergence_failures: outcome.convergence_failures,
        stats: outcome.stats,
    };
    if opts.json {
        match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{text}"),
            Err(err) => {
                eprintln!("error: {err}");
                return ExitCode::from(1);
            }
        }
    } else {
        print_report(&report);
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_defaults_and_options() {
        let opts = parse_args(&[]).unwrap();
        assert_eq!(opts.solver, SolverChoice::Dense);
        assert_eq!(opts.backend, Backend::Serial);

        let opts = parse_args(&args(&[
            "--solver", "gmres", "--backend", "threaded", "--steps", "40", "--json",
        ]))
        .unwrap();
        assert_eq!(opts.solver, SolverChoice::Gmres);
        assert_eq!(opts.backend, Backend::Threaded);
        assert_eq!(opts.steps, 40);
        assert!(opts.json);

        assert!(parse_args(&args(&["--solver", "cholesky"])).is_err());
        assert!(parse_args(&args(&["--steps"])).is_err());
        assert!(parse_args(&args(&["--steps", "0"])).is_err());
    }

    #[test]
    fn test_every_solver_conserves_mass() {
        for solver in [
            SolverChoice::Dense,
            SolverChoice::Band,
            SolverChoice::Sparse,
            SolverChoice::Gmres,
        ] {
            let opts = Options {
                solver,
                steps: 100,
                ..Options::default()
            };
            let outcome = run(&opts).unwrap();
            let total: Real = outcome.y.iter().sum();
            assert!((total - 1.0).abs() < 1e-8, "{solver:?}: total = {total}");
            assert!(outcome.y[0] > 0.98 && outcome.y[0] < 0.99, "{solver:?}: {:?}", outcome.y);
        }
    }
}
