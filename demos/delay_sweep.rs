// Delay sweep example
//
// Homes the delay stage, then steps it across a range of positions and records
// the coincidence counts at each step. This is the basic two-photon
// interference scan. Use --simulate to run it without any hardware attached.

use clap::Parser;
use qolab_rs::{
    sim, CoincidenceCounter, CoincidenceCounterConfig, DelayStage, DelayStageConfig, Instrument,
    LabConfig, SystemClock, Transport,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "delay_sweep")]
#[command(version = "1.0")]
#[command(about = "Sweep the delay stage and record coincidence counts")]
#[command(long_about = "Home the delay stage, step it from --start to --stop and read the coincidence counter at every position. Instrument ports come from a lab TOML file; QOLAB_* environment variables override it.")]
struct Args {
    /// Lab configuration file
    #[arg(short, long, default_value = "lab.toml")]
    config: PathBuf,

    /// First position in millimetres
    #[arg(long, default_value_t = 5.0)]
    start: f64,

    /// Last position in millimetres
    #[arg(long, default_value_t = 7.0)]
    stop: f64,

    /// Step size in millimetres
    #[arg(long, default_value_t = 0.1)]
    step: f64,

    /// Integration window per point in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    window_ms: u32,

    /// Coincidence window in nanoseconds
    #[arg(long, default_value_t = 3)]
    coincidence_ns: u32,

    /// Run against simulated instruments instead of serial ports
    #[arg(long, help = "Use built-in simulated instruments, no hardware needed")]
    simulate: bool,

    /// Enable verbose logging
    #[arg(short, long, help = "Show debug information and detailed logs")]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    if args.step <= 0.0 || args.stop < args.start {
        eprintln!("Need --step > 0 and --stop >= --start");
        std::process::exit(1);
    }

    println!("Delay Sweep");
    println!("===========");
    println!("Range: {} mm to {} mm in {} mm steps", args.start, args.stop, args.step);
    println!("Window: {} ms, coincidence window {} ns\n", args.window_ms, args.coincidence_ns);

    if args.simulate {
        println!("Using simulated instruments\n");
        let mut stage = DelayStage::with_transport(
            sim::delay_stage(3),
            &DelayStageConfig::new("sim-stage"),
            Arc::new(SystemClock),
        )?;
        let mut counter = CoincidenceCounter::with_transport(
            sim::coincidence_counter([41_230, 39_874, 1_187]),
            &CoincidenceCounterConfig::new("sim-counter"),
            Arc::new(SystemClock),
        )?;
        sweep(&mut stage, &mut counter, &args)?;
        stage.close()?;
        counter.close()?;
        return Ok(());
    }

    let lab = LabConfig::load(&args.config)?;
    let (Some(stage_config), Some(counter_config)) = (&lab.delay_stage, &lab.coincidence_counter)
    else {
        eprintln!(
            "{} needs both a [delay_stage] and a [coincidence_counter] section",
            args.config.display()
        );
        std::process::exit(1);
    };

    let mut stage = DelayStage::open(stage_config)?;
    println!("✓ Delay stage on {}", stage_config.port_path);
    let mut counter = CoincidenceCounter::open(counter_config)?;
    println!("✓ Coincidence counter on {}\n", counter_config.port_path);

    sweep(&mut stage, &mut counter, &args)?;
    stage.close()?;
    counter.close()?;
    Ok(())
}

fn sweep<S: Transport, C: Transport>(
    stage: &mut DelayStage<S>,
    counter: &mut CoincidenceCounter<C>,
    args: &Args,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("Homing stage...");
    stage.home()?;
    counter.configure(args.window_ms, args.coincidence_ns)?;

    println!("{:>12} {:>10} {:>10} {:>8}", "position_mm", "ch1", "ch2", "coinc");
    let steps = ((args.stop - args.start) / args.step).round() as u32;
    for i in 0..=steps {
        let target = (args.start + f64::from(i) * args.step).min(args.stop);
        let position = stage.move_to(target)?;
        let counts = counter.read_counts()?;
        println!(
            "{:>12.4} {:>10} {:>10} {:>8}",
            position, counts.ch1, counts.ch2, counts.coincidences
        );
    }

    println!("\nSweep completed with {} points", steps + 1);
    Ok(())
}
