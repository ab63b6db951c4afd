use anyhow::Error;
use clap::Parser;
use log::LevelFilter;
use log4rs::{
    append::console::{ConsoleAppender, Target},
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};
use pagelog::{WorkerMode, WorkloadConfig};

#[derive(Parser)]
struct Cli {
    /// Number of concurrent workers
    #[arg(short, long, default_value_t = 4)]
    workers: u32,

    /// Number of thunks every worker runs through
    #[arg(short, long, default_value_t = 3)]
    thunks: u32,

    /// Number of pages touched per thunk
    #[arg(short, long, default_value_t = 4)]
    pages: usize,

    /// Run workers as forked processes instead of threads
    #[arg(long)]
    processes: bool,

    /// Do not dump the log after the run
    #[arg(short, long)]
    quiet: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) -> Result<(), Error> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    let stderr = ConsoleAppender::builder()
        .target(Target::Stderr)
        .encoder(Box::new(PatternEncoder::new(
            "{d(%H:%M:%S%.3f)} {h({l:<5})} {t} - {m}{n}",
        )))
        .build();
    let config = Config::builder()
        .appender(Appender::builder().build("stderr", Box::new(stderr)))
        .build(Root::builder().appender("stderr").build(level))?;
    log4rs::init_config(config)?;

    Ok(())
}

fn main() -> Result<(), Error> {
    let args = Cli::parse();
    init_logging(args.verbose)?;

    let config = WorkloadConfig {
        workers: args.workers,
        thunks: args.thunks,
        pages_per_thunk: args.pages,
        mode: if args.processes {
            WorkerMode::Processes
        } else {
            WorkerMode::Threads
        },
    };
    log::info!(
        "Running {} workers with {} thunks of {} pages ({:?})",
        config.workers,
        config.thunks,
        config.pages_per_thunk,
        config.mode
    );

    let (log, report) = pagelog::record(&config)?;

    if !args.quiet {
        log.print();
    }
    println!("{report}");

    Ok(())
}
