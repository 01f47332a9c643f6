//! # RasterPrep CLI
//!
//! Command-line front end: load a recorded simulation run from JSON and
//! prepare raster or spike-histogram figure data.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;

use rasterprep_core::{Include, JsonFigureStore, SaveNaming, SimulationRun};
use rasterprep_spikes::{
    prepare_raster, prepare_spike_hist, OrderBy, PrepareOptions, RateMode, SpikeData,
};

#[derive(Parser)]
#[command(name = "rasterprep")]
#[command(author = "Yatrogenesis")]
#[command(version = "0.1.0")]
#[command(about = "Prepare recorded spike trains for plotting", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize a recorded run
    Info {
        /// Run file (JSON)
        run: PathBuf,
    },

    /// Prepare raster figure data
    Raster {
        /// Run file (JSON)
        run: PathBuf,
        /// Populations, stimulus labels, or selectors like allCells / allNetStims
        #[arg(short, long)]
        include: Vec<String>,
        /// Ordering key: gid, pop, or a numeric tag name
        #[arg(short, long, default_value = "gid")]
        order_by: String,
        /// Window start (ms)
        #[arg(long)]
        start: Option<f64>,
        /// Window end (ms)
        #[arg(long)]
        end: Option<f64>,
        /// Cap on prepared events
        #[arg(long)]
        max_spikes: Option<usize>,
        /// Rate reporting: off, full, minimal
        #[arg(long, default_value = "full")]
        rates: String,
        /// Persist the prepared data as JSON
        #[arg(short, long)]
        save: bool,
        /// Output directory for saved data
        #[arg(long)]
        out_dir: Option<String>,
    },

    /// Prepare spike-histogram figure data
    Hist {
        /// Run file (JSON)
        run: PathBuf,
        /// Populations, stimulus labels, or selectors like allCells / allNetStims
        #[arg(short, long)]
        include: Vec<String>,
        /// Window start (ms)
        #[arg(long)]
        start: Option<f64>,
        /// Window end (ms)
        #[arg(long)]
        end: Option<f64>,
        /// Rate reporting: off, full, minimal
        #[arg(long, default_value = "full")]
        rates: String,
        /// Persist the prepared data as JSON
        #[arg(short, long)]
        save: bool,
        /// Output directory for saved data
        #[arg(long)]
        out_dir: Option<String>,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Info { run } => {
            let sim = load_run(&run)?;
            println!("{} {}", "Run:".green().bold(), sim.config.label.cyan());
            println!("  duration: {} ms", sim.config.duration);
            println!("  cells: {}", sim.cells.len());
            println!("  recorded spikes: {}", sim.spikes.n_events());
            println!("{}", "Populations:".green().bold());
            for pop in &sim.pops {
                println!("  {} ({} cells)", pop.name.cyan(), pop.cell_gids.len());
            }
            let labels = sim.stim_labels();
            if !labels.is_empty() {
                println!("{} {}", "Stimulus labels:".green().bold(), labels.join(", "));
            }
        }

        Commands::Raster {
            run,
            include,
            order_by,
            start,
            end,
            max_spikes,
            rates,
            save,
            out_dir,
        } => {
            let sim = load_run(&run)?;
            let mut opts = PrepareOptions::raster();
            if !include.is_empty() {
                opts.include = parse_include(&include);
            }
            opts.order_by = parse_order(&order_by);
            opts.time_range = parse_window(start, end, sim.config.duration);
            if let Some(cap) = max_spikes {
                opts.max_spikes = cap;
            }
            opts.pop_rates = parse_rates(&rates)?;
            opts.save = save;
            opts.naming = SaveNaming {
                file_dir: out_dir,
                ..Default::default()
            };

            let mut store = JsonFigureStore::new(&sim.config.label);
            let data = prepare_raster(&sim, &opts, Some(&mut store));
            report(&run, data.as_ref());
        }

        Commands::Hist {
            run,
            include,
            start,
            end,
            rates,
            save,
            out_dir,
        } => {
            let sim = load_run(&run)?;
            let mut opts = PrepareOptions::hist();
            if !include.is_empty() {
                opts.include = parse_include(&include);
            }
            opts.time_range = parse_window(start, end, sim.config.duration);
            opts.pop_rates = parse_rates(&rates)?;
            opts.save = save;
            opts.naming = SaveNaming {
                file_dir: out_dir,
                ..Default::default()
            };

            let mut store = JsonFigureStore::new(&sim.config.label);
            let data = prepare_spike_hist(&sim, &opts, Some(&mut store));
            report(&run, data.as_ref());
        }
    }

    Ok(())
}

fn load_run(path: &Path) -> Result<SimulationRun> {
    let file = File::open(path).with_context(|| format!("cannot open run file {}", path.display()))?;
    let sim = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("cannot parse run file {}", path.display()))?;
    Ok(sim)
}

fn parse_include(items: &[String]) -> Vec<Include> {
    items
        .iter()
        .map(|item| match item.as_str() {
            "all" => Include::All,
            "allCells" => Include::AllCells,
            "allNetStims" => Include::AllNetStims,
            "eachPop" => Include::EachPop,
            name => match name.parse::<u64>() {
                Ok(gid) => Include::Gid(gid),
                Err(_) => Include::Name(name.to_string()),
            },
        })
        .collect()
}

fn parse_order(key: &str) -> OrderBy {
    match key {
        "gid" => OrderBy::Gid,
        "pop" => OrderBy::Pop,
        tag => OrderBy::Tag(tag.to_string()),
    }
}

fn parse_rates(mode: &str) -> Result<RateMode> {
    match mode {
        "off" => Ok(RateMode::Off),
        "full" => Ok(RateMode::Full),
        "minimal" => Ok(RateMode::Minimal),
        other => bail!("unknown rate mode: {}", other),
    }
}

fn parse_window(start: Option<f64>, end: Option<f64>, duration: f64) -> Option<(f64, f64)> {
    match (start, end) {
        (None, None) => None,
        (start, end) => Some((start.unwrap_or(0.0), end.unwrap_or(duration))),
    }
}

fn report(run: &Path, data: Option<&SpikeData>) {
    println!("{} {}", "Loading run:".green().bold(), run.display());
    match data {
        Some(data) => {
            println!(
                "{} {} events across {} populations",
                "Prepared".green().bold(),
                data.spk_times.len(),
                data.pop_labels.len()
            );
            println!("  window: {:.1} to {:.1} ms", data.time_range.0, data.time_range.1);
            println!("  title: {}", data.axis_args.title.cyan());
            for label in &data.legend_labels {
                println!("  {}", label.replace('\n', " "));
            }
        }
        None => println!("{}", "No spikes available to plot".yellow()),
    }
}
