// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Runs random traffic through a two-level MESI memory system and prints
//! the controller statistics as YAML.

use anyhow::Context;
use env_logger::Target;
use structopt::StructOpt;

use coherence::{verify_completions, RandomTraffic, System, SystemConfiguration, TrafficConfiguration};

#[derive(StructOpt)]
#[structopt(name = "mesi_sim", about = "A two-level MESI coherence simulator")]
struct Arguments {
    /// YAML system configuration; built-in defaults when absent
    #[structopt(short, long)]
    config: Option<String>,
    /// requests issued by every core
    #[structopt(short, long, default_value = "1000")]
    requests: usize,
    /// distinct cache lines touched
    #[structopt(short, long, default_value = "64")]
    lines: usize,
    /// percentage of stores
    #[structopt(short, long, default_value = "40")]
    stores: u32,
    /// single word DMA transfers
    #[structopt(long, default_value = "0")]
    dma: usize,
    /// overrides the configured seed
    #[structopt(long)]
    seed: Option<u64>,
    #[structopt(long, default_value = "1000000")]
    max_cycles: usize,
    /// check the coherence invariants after every cycle
    #[structopt(long)]
    check: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Arguments::from_args();

    let _logger = env_logger::builder()
        .filter(Some("mesi_sim"), log::LevelFilter::Info)
        .target(Target::Stderr)
        .init();

    let mut config = match &args.config {
        Some(path) => SystemConfiguration::from_file(path)?,
        None => SystemConfiguration::default(),
    };
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    log::info!("configuration:\n{}", serde_yaml::to_string(&config)?);

    let traffic = TrafficConfiguration {
        requests_per_core: args.requests,
        lines: args.lines,
        store_percent: args.stores,
        dma_transfers: args.dma,
        check_invariants: args.check,
        ..Default::default()
    };
    let seed = config.seed;
    let mut system = System::new(config).context("Failed to build the memory system")?;
    let mut driver = RandomTraffic::new(traffic, seed);
    let cycles = driver.run(&mut system, args.max_cycles)?;
    verify_completions(driver.log()).context("Completion log is not coherent")?;
    log::info!(
        "{} accesses verified in {} cycles",
        driver.log().len(),
        cycles
    );

    println!("{}", serde_yaml::to_string(&system.stats())?);
    Ok(())
}
