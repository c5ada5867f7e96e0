//! Telepresence: local development environment for a remote Kubernetes
//! cluster.

mod args;
mod env_files;
mod mount;
mod session;

use std::process::ExitCode;

use clap::Parser;

use args::Args;
use telepresence_runner::Runner;

fn main() -> ExitCode {
    let mut args = Args::parse();

    // Hidden mode used by the inject-tcp tunnel verification: we get re-run
    // under torsocks purely to attempt one TCP connection.
    if let Some(target) = args.probe_connect.clone() {
        return ExitCode::from(telepresence_outbound::run_connect_probe(&target) as u8);
    }

    if let Err(message) = args.normalize() {
        eprintln!("{}", message);
        return ExitCode::from(1);
    }
    if args.run.is_none() && !args.run_shell && args.docker_run.is_none() {
        eprintln!("One of --run, --run-shell, or --docker-run is required.");
        return ExitCode::from(1);
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(exc) => {
            eprintln!("Failed to start runtime: {}", exc);
            return ExitCode::from(1);
        }
    };
    let code = runtime.block_on(run(args));
    ExitCode::from(code as u8)
}

async fn run(args: Args) -> i32 {
    let runner = match Runner::new(&args.logfile, args.verbose, env!("CARGO_PKG_VERSION")) {
        Ok(runner) => runner,
        Err(exc) => {
            eprintln!("T: {}", exc);
            return 1;
        }
    };
    telepresence_runner::init_logging(runner.output(), args.verbose);
    if let Err(exc) = runner.install_signal_handlers() {
        runner.show(&format!("Failed to install signal handlers: {}", exc));
        return 1;
    }

    let result = session::run_session(&runner, &args).await;

    // Every exit path unwinds the cleanup stack: swap-backs, deletions,
    // unmounts, process shutdown, cache flush.
    runner.run_cleanup().await;

    match result {
        Ok(code) => {
            runner.write(&format!("EXITING with status code {}", code));
            code
        }
        Err(exc) => {
            let code = exc.exit_code();
            runner.show(&exc.to_string());
            runner.write(&format!("EXITING with status code {}", code));
            code
        }
    }
}
