use clap::Parser as ClapParser;
use std::process;

use ephemeron::{
    HeapSettings,
    scenarios::{self, Scenario, ScenarioOptions},
};

#[derive(ClapParser, Debug)]
#[command(
    author,
    version,
    about = "Weak collection scenarios on a compacting heap",
    long_about = None
)]
struct Cli {
    /// Scenarios to run in order (all if none are given)
    #[arg(value_enum)]
    scenarios: Vec<Scenario>,

    /// Object cells per page
    #[arg(long, default_value_t = 256)]
    page_cells: usize,

    /// Page limit before allocation fails
    #[arg(long, default_value_t = 4096)]
    max_pages: usize,

    /// Entry budget shared by all table backing stores
    #[arg(long, default_value_t = 1 << 22)]
    max_backing_entries: usize,

    /// Occupancy at or below which a page is evacuated
    #[arg(long, default_value_t = 0.25)]
    evacuation_threshold: f64,

    /// Evacuate every occupied page on every cycle
    #[arg(long, conflicts_with = "never_compact")]
    always_compact: bool,

    /// Never evacuate
    #[arg(long)]
    never_compact: bool,

    /// Verify the heap after every cycle
    #[arg(long)]
    verify_heap: bool,

    /// Objects scanned per incremental marking step
    #[arg(long, default_value_t = 64)]
    step_budget: usize,

    /// Rounds of the stress scenario
    #[arg(long, default_value_t = 50)]
    iterations: usize,
}

impl Cli {
    fn settings(&self) -> HeapSettings {
        HeapSettings {
            page_cells: self.page_cells,
            max_pages: self.max_pages,
            max_backing_entries: self.max_backing_entries,
            evacuation_threshold: self.evacuation_threshold,
            always_compact: self.always_compact,
            never_compact: self.never_compact,
            verify_heap: self.verify_heap || cfg!(debug_assertions),
            incremental_step_budget: self.step_budget,
            ..HeapSettings::default()
        }
    }
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let settings = cli.settings();
    if let Err(err) = settings.validate() {
        eprintln!("Invalid heap settings: {}", err);
        process::exit(2);
    }

    let options = ScenarioOptions {
        settings,
        iterations: cli.iterations,
    };
    let selected = if cli.scenarios.is_empty() {
        Scenario::ALL.to_vec()
    } else {
        cli.scenarios.clone()
    };

    let mut failed = 0;
    for scenario in selected {
        match scenarios::run(scenario, &options) {
            Ok(report) => println!("ok    {}", report),
            Err(err) => {
                println!("FAIL  {:<18} {}", scenario.name(), err);
                failed += 1;
            }
        }
    }

    if failed > 0 {
        eprintln!("{} scenario(s) failed", failed);
        process::exit(1);
    }
}
