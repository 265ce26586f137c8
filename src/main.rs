use anyhow::{Context, Result};
use clap::{App, Arg};

use std::fs;
use std::process;

use vg2opt::trace::{load_source, Normalizer};

fn app<'a, 'b>() -> App<'a, 'b> {
    App::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .arg(
            Arg::with_name("create-jsvar")
                .help("Emit the trace as a JavaScript variable assignment")
                .long("create_jsvar")
                .value_name("NAME")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("end-of-trace-error-msg")
                .help("Runtime error message to attach to the end of the trace")
                .long("end-of-trace-error-msg")
                .value_name("MSG")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("basename")
                .help("Basename B of the trace; reads B.vgtrace and B.c or B.cpp")
                .required(true)
                .index(1),
        )
}

fn run() -> Result<()> {
    let matches = app().get_matches();
    let normalizer = Normalizer::from(&matches);

    let basename = matches.value_of("basename").unwrap();
    let trace_path = format!("{}.vgtrace", basename);
    let raw = fs::read(&trace_path).with_context(|| format!("failed to read {}", trace_path))?;
    let raw = String::from_utf8_lossy(&raw);
    let code = load_source(basename)?;

    let trace = normalizer.normalize(&raw, &code)?;
    let json = trace.to_json()?;

    match matches.value_of("create-jsvar") {
        Some(name) => println!("var {} = {};", name, json),
        None => println!("{}", json),
    }

    Ok(())
}

fn main() {
    env_logger::init();

    process::exit(match run() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("Fatal: {:#}", e);
            1
        }
    });
}
