// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! linkbond bonds several UDP paths between two peers into one virtual
//! point-to-point IP interface.

use std::{ffi::CString, io, path::PathBuf, process::exit};
use structopt::{clap::ErrorKind, StructOpt};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod config;
mod daemon;
mod script;
mod socket;
mod tun;

use config::Config;

const EXIT_USAGE: i32 = 2;

#[derive(Debug, StructOpt)]
#[structopt(name = "linkbond", about = "Multi-link aggregating VPN")]
struct Args {
    /// Path to the configuration file
    #[structopt(
        short = "c",
        long = "config",
        default_value = "/etc/linkbond/linkbond.conf"
    )]
    config: PathBuf,

    /// Enable debug output
    #[structopt(long)]
    debug: bool,

    /// Do not update the process title
    #[structopt(long = "natural-title")]
    natural_title: bool,

    /// Process name shown in logs
    #[structopt(short = "n", long = "name")]
    name: Option<String>,

    /// Drop privileges to this user after startup
    #[structopt(short = "u", long = "user")]
    user: Option<String>,

    /// Increase verbosity
    #[structopt(short = "v", long = "verbose", parse(from_occurrences))]
    verbose: u8,

    /// Decrease verbosity
    #[structopt(short = "q", long = "quiet", parse(from_occurrences))]
    quiet: u8,

    /// Allow running with uid 0
    #[structopt(long = "yes-run-as-root")]
    yes_run_as_root: bool,

    /// Preset a tunnel's quota allowance: tunnel:value[bkm]
    #[structopt(short = "p", long = "permitted", number_of_values = 1)]
    permitted: Vec<String>,
}

fn main() {
    let args = match Args::from_args_safe() {
        Ok(args) => args,
        Err(err)
            if matches!(
                err.kind,
                ErrorKind::HelpDisplayed | ErrorKind::VersionDisplayed
            ) =>
        {
            println!("{err}");
            exit(0);
        }
        Err(err) => {
            eprintln!("{err}");
            exit(EXIT_USAGE);
        }
    };

    init_tracing(&args);

    let permitted = match args
        .permitted
        .iter()
        .map(|arg| config::parse_permitted(arg))
        .collect::<Result<Vec<_>, _>>()
    {
        Ok(permitted) => permitted,
        Err(err) => {
            eprintln!("{err}");
            exit(EXIT_USAGE);
        }
    };

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            error!(path = %args.config.display(), %err, "cannot load configuration");
            exit(1);
        }
    };

    if running_as_root() && !args.yes_run_as_root && args.user.is_none() {
        error!(
            "you are not allowed to run this program as root. \
             please specify a valid user with --user"
        );
        exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(%err, "cannot initialize the event loop");
            exit(1);
        }
    };

    match runtime.block_on(daemon::run(args.config, config, permitted, args.user)) {
        Ok(()) => exit(0),
        Err(err) => {
            error!(%err, "fatal");
            exit(1);
        }
    }
}

fn init_tracing(args: &Args) {
    let level = if args.debug {
        "debug"
    } else {
        match 1 + args.verbose as i16 - args.quiet as i16 {
            i16::MIN..=0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if let Some(name) = &args.name {
        // keep the configured name visible in every line
        builder
            .with_target(false)
            .init();
        tracing::info!(process = %name, natural_title = args.natural_title, "starting");
    } else {
        builder.init();
    }
}

fn running_as_root() -> bool {
    // SAFETY: geteuid has no failure modes
    unsafe { libc::geteuid() == 0 }
}

/// Switches to an unprivileged account once the tun device exists
pub(crate) fn drop_privileges(user: &str) -> io::Result<()> {
    let name = CString::new(user)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "invalid username"))?;

    // SAFETY: getpwnam returns a pointer into static libc storage; we copy
    // the ids out before making any other libc call
    let passwd = unsafe { libc::getpwnam(name.as_ptr()) };
    if passwd.is_null() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            "invalid unprivileged username",
        ));
    }
    let (uid, gid) = unsafe { ((*passwd).pw_uid, (*passwd).pw_gid) };

    // SAFETY: plain syscalls, order matters: group first
    unsafe {
        if libc::setgid(gid) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::setuid(uid) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    tracing::info!(user, "dropped privileges");
    Ok(())
}
