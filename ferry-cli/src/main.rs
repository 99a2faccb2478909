// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};

use validators::{parse_socketaddr, validate_socketaddr};

mod forward;
mod validators;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("ferry=info,debug"));
  let collector = tracing_subscriber::fmt()
    .pretty()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("tcp")
        .about("Accept TCP connections and relay each one to a fixed target")
        .arg(
          Arg::new("listen")
            .long("listen")
            .short('l')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("target")
            .long("target")
            .short('t')
            .validator(validate_socketaddr)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("low-memory")
            .help("Prefer pooled read-wait buffers even where they cost an extra copy")
            .long("low-memory")
            .takes_value(false),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

pub fn forward_arg_handling(args: &'_ ArgMatches) -> Result<forward::ForwardArgs> {
  Ok(forward::ForwardArgs {
    listen: parse_socketaddr(args.value_of("listen").unwrap())?,
    target: parse_socketaddr(args.value_of("target").unwrap())?,
    low_memory: args.is_present("low-memory"),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("tcp", opts) => {
      let config = forward_arg_handling(opts)?;
      tracing::info!("Running as TCP forwarder with config {:#?}", config);
      forward::forward_main(config).await
    }
    (_, _) => unreachable!(),
  }
}
