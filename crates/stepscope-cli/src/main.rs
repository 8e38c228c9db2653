//! Command-line front end: read guest source, run it under the supervisor,
//! print the typed result as JSON.

use std::{
    fs,
    io::Read as _,
    process::ExitCode,
};

use clap::Parser;
use stepscope::{Config, ExecuteOptions, ExecuteRequest, ExecutionStatus, Supervisor};

/// Trace a Python snippet under the stepscope sandbox.
#[derive(Debug, Parser)]
#[command(name = "stepscope", version, about)]
struct Args {
    /// Source file to execute; reads stdin when omitted.
    file: Option<String>,

    /// Scripted input lines fed to the guest's input() calls.
    #[arg(long, default_value = "")]
    input: String,

    /// Session id for cancellation bookkeeping.
    #[arg(long)]
    session_id: Option<String>,

    /// Lower the step ceiling for this run.
    #[arg(long)]
    max_steps: Option<u32>,

    /// Report status and stdout only, without the step list.
    #[arg(long)]
    no_trace: bool,

    /// Pretty-print the JSON result.
    #[arg(long)]
    pretty: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let code = match read_source(args.file.as_deref()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err}");
            return ExitCode::FAILURE;
        }
    };

    let supervisor = Supervisor::new(Config::from_env());
    let mut request = ExecuteRequest::new(code).with_input(args.input).with_options(ExecuteOptions {
        trace: !args.no_trace,
        max_steps: args.max_steps,
    });
    if let Some(session_id) = args.session_id {
        request = request.with_session_id(session_id);
    }

    let result = supervisor.execute(request);
    let rendered = if args.pretty {
        serde_json::to_string_pretty(&result)
    } else {
        serde_json::to_string(&result)
    };
    match rendered {
        Ok(json) => println!("{json}"),
        Err(err) => {
            eprintln!("error: failed to serialize result: {err}");
            return ExitCode::FAILURE;
        }
    }

    if result.status == ExecutionStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn read_source(path: Option<&str>) -> Result<String, String> {
    match path {
        Some(path) => fs::read_to_string(path).map_err(|err| format!("cannot read {path}: {err}")),
        None => {
            let mut code = String::new();
            std::io::stdin()
                .read_to_string(&mut code)
                .map_err(|err| format!("cannot read stdin: {err}"))?;
            Ok(code)
        }
    }
}
