//! shell-exec binary entry point.

use std::io::Write;
use std::process::ExitCode;

use shell_exec::cli::{self, Args};
use shell_exec::config::{self, Config};
use shell_exec::logging;
use shell_exec::remote::{ssh, RemoteProcess};
use tracing::{debug, error, info};

fn main() -> ExitCode {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("error: {e}");
            eprintln!("Run 'shell-exec --help' for usage.");
            return ExitCode::from(2);
        }
    };

    if args.help {
        cli::print_help();
        return ExitCode::SUCCESS;
    }
    if args.version {
        cli::print_version();
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };
    // A subscriber installed elsewhere is fine.
    let _ = logging::init_with_filter(&config.log_filter());

    let code = run(&args, &config);
    ssh::shutdown();
    code
}

fn run(args: &Args, config: &Config) -> ExitCode {
    let Some(endpoint) = args.endpoint.as_deref() else {
        return ExitCode::from(2);
    };
    let defaults = config.remote_defaults();
    let target = defaults
        .target(endpoint)
        .credential(config::credential(args));
    let command = defaults
        .command(args.command_line())
        .capture()
        .pty(args.pty);

    info!(endpoint, command = %command.command, "running remote command");

    let result = RemoteProcess::spawn(ssh::connector(), target, command).and_then(|mut process| {
        let (out, err) = process.communicate(None, None)?;
        Ok((out, err, process.wait(None)?))
    });

    let mut stdout = std::io::stdout();
    let mut stderr = std::io::stderr();
    match result {
        Ok((out, err, code)) => {
            let _ = stdout.write_all(&out);
            let _ = stderr.write_all(&err);
            debug!(code, "remote command finished");
            if code == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            if let Some(output) = e.output() {
                let _ = stdout.write_all(output);
            }
            error!("{e}");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
