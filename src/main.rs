//! M/M/c queueing model on top of the simulation engine.
//!
//! Customers arrive with exponentially distributed inter-arrival times,
//! request one of `c` identical servers, and hold it for an exponentially
//! distributed service time. The engine delivers events back to this
//! script, which decides what each kind means.
#![warn(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications
)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::default_trait_access)]

use std::num::NonZeroUsize;
use std::path::PathBuf;

use clap::Parser;
use eyre::eyre;
use serde::Serialize;

use qsim::{
    EntityId, ExponentialService, RequestOutcome, SimulationClock, Step, Transition, NUM_STREAMS,
};

/// What an event means to this model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelEvent {
    /// A new customer enters the system.
    Arrival,
    /// A customer asks for a server.
    Request,
    /// A customer's service is finished.
    Completion,
}

/// Runs an M/M/c queueing simulation.
#[derive(Parser)]
#[clap(version)]
struct Opt {
    /// Total simulated time.
    #[clap(long, default_value = "120")]
    horizon: f64,

    /// Mean time between customer arrivals.
    #[clap(long, default_value = "5.0")]
    inter_arrival: f64,

    /// Mean service time.
    #[clap(long, default_value = "6.0")]
    service: f64,

    /// Number of servers.
    #[clap(long, default_value = "1")]
    servers: usize,

    /// Random number generator stream (1-15).
    #[clap(long, default_value = "1")]
    stream: u32,

    /// Name printed in the report.
    #[clap(long, default_value = "M/M/c")]
    name: String,

    /// Print a line for every transition of the run.
    #[clap(long)]
    trace: bool,

    /// Emit the report as JSON instead of text.
    #[clap(long)]
    json: bool,

    /// Verbosity.
    #[clap(short, long, parse(from_occurrences))]
    verbose: i32,

    /// Store the logs in this file.
    #[clap(long)]
    log_output: Option<PathBuf>,

    /// Do not log to the stderr.
    #[clap(long)]
    no_stderr: bool,
}

/// End-of-run summary of the simulation.
#[derive(Debug, Serialize)]
struct Report {
    model: String,
    time: f64,
    servers: usize,
    arrivals: u64,
    utilization: f64,
    mean_busy_time: f64,
    average_queue_length: f64,
    total_releases: u64,
    queue_exits: u64,
}

fn print_transition(transition: Transition<ModelEvent>) {
    match transition {
        Transition::Caused {
            kind: ModelEvent::Arrival,
            entity,
            time,
        } => println!("customer {} arrived at {:.4}", entity, time),
        Transition::Acquired {
            entity,
            server,
            time,
        } => println!("customer {} acquired server {} at {:.4}", entity, server, time),
        Transition::Enqueued {
            entity,
            backlog_len,
            time,
        } => println!("customer {} blocked at {:.4} (inq = {})", entity, time, backlog_len),
        Transition::Reassigned {
            entity,
            server,
            backlog_len,
            time,
        } => println!(
            "customer {} dequeued onto server {} at {:.4} (inq = {})",
            entity, server, time, backlog_len
        ),
        Transition::Released { entity, time, .. } => {
            println!("customer {} leaving at {:.4}", entity, time);
        }
        Transition::Caused { .. } => {}
    }
}

fn run(opt: &Opt) -> eyre::Result<Report> {
    let servers =
        NonZeroUsize::new(opt.servers).ok_or_else(|| eyre!("at least one server is required"))?;
    eyre::ensure!(
        (1..=NUM_STREAMS).contains(&opt.stream),
        "stream must be between 1 and {}",
        NUM_STREAMS
    );

    let policy = ExponentialService::new(ModelEvent::Completion, opt.service)?;
    let mut clock = SimulationClock::new(opt.horizon, servers, opt.stream, policy)?;
    if opt.trace {
        clock = clock.trace_hook(Box::new(print_transition));
    }

    let mut next_customer = 1_usize;
    let mut arrivals = 0_u64;
    clock.schedule_relative(ModelEvent::Arrival, 0.0, EntityId::from(next_customer))?;

    while let Step::Event(event) = clock.advance() {
        match event.kind {
            ModelEvent::Arrival => {
                arrivals += 1;
                clock.schedule_relative(ModelEvent::Request, 0.0, event.entity)?;
                next_customer += 1;
                let delay = clock.stream_mut().exponential(opt.inter_arrival)?;
                clock.schedule_relative(
                    ModelEvent::Arrival,
                    delay,
                    EntityId::from(next_customer),
                )?;
            }
            ModelEvent::Request => {
                if let RequestOutcome::Acquired { .. } = clock.request(event.entity) {
                    let delay = clock.stream_mut().exponential(opt.service)?;
                    clock.schedule_relative(ModelEvent::Completion, delay, event.entity)?;
                }
            }
            ModelEvent::Completion => clock.release(event.entity)?,
        }
    }
    log::info!(
        "halted at {} after {} arrivals and {} releases",
        clock.now(),
        arrivals,
        clock.release_count()
    );

    Ok(Report {
        model: opt.name.clone(),
        time: clock.now(),
        servers: clock.server_count(),
        arrivals,
        utilization: clock.utilization(),
        mean_busy_time: clock.mean_busy_time(),
        average_queue_length: clock.average_queue_length(),
        total_releases: clock.release_count(),
        queue_exits: clock.queue_exit_count(),
    })
}

fn print_report(report: &Report) {
    println!();
    println!("----------- simulation report -----------");
    println!("model:                {}", report.model);
    println!("time:                 {:.2}", report.time);
    println!("servers:              {}", report.servers);
    println!("arrivals:             {}", report.arrivals);
    println!("utilization:          {:.2}", report.utilization);
    println!("mean busy time:       {:.2}", report.mean_busy_time);
    println!("average queue length: {:.2}", report.average_queue_length);
    println!("total releases:       {}", report.total_releases);
    println!("queue exits:          {}", report.queue_exits);
}

/// Set up a logger based on the given user options.
fn set_up_logger(opt: &Opt) -> Result<(), fern::InitError> {
    let log_level = match opt.verbose {
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        3 => log::LevelFilter::Trace,
        _ => log::LevelFilter::Warn,
    };
    let dispatch = fern::Dispatch::new()
        .format(|out, message, record| out.finish(format_args!("[{}] {}", record.level(), message)))
        .level(log_level);
    let dispatch = if let Some(path) = &opt.log_output {
        let _ = std::fs::remove_file(path);
        dispatch.chain(
            std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .append(false)
                .open(path)?,
        )
    } else {
        dispatch
    };
    let dispatch = if opt.no_stderr {
        dispatch
    } else {
        dispatch.chain(std::io::stderr())
    };
    dispatch.apply()?;
    Ok(())
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let opt = Opt::parse();
    set_up_logger(&opt)?;
    let report = run(&opt)?;
    if opt.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}
