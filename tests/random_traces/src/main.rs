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

//! Random request traces run to quiescence, with the coherence invariants
//! checked every cycle and the observed values replayed afterwards.

use coherence::{
    verify_completions, CacheGeometry, ChannelConfiguration, Cycle, RandomTraffic, System,
    SystemConfiguration, TrafficConfiguration, CHANNEL_RESERVE,
};

const MAX_CYCLES: Cycle = 2_000_000;

/// Small caches so that replacements and write-backs race with requests.
fn small_caches(num_cpus: usize, num_l2caches: usize, num_dirs: usize) -> SystemConfiguration {
    let mut config = SystemConfiguration {
        num_cpus,
        num_l2caches,
        num_dirs,
        ..Default::default()
    };
    config.l1.icache = CacheGeometry::new(256, 2);
    config.l1.dcache = CacheGeometry::new(512, 2);
    config.l1.max_outstanding = 4;
    config.l1.deadlock_threshold = 50_000;
    config.l2.cache = CacheGeometry::new(1024, 2);
    config.l2.max_outstanding = 8;
    config.directory.memory_latency = 10;
    config.dma.deadlock_threshold = 50_000;
    config
}

fn traffic(requests_per_core: usize, lines: usize) -> TrafficConfiguration {
    TrafficConfiguration {
        requests_per_core,
        lines,
        check_invariants: true,
        ..Default::default()
    }
}

/// Runs one trace and returns the cycles it took and the accesses checked.
pub fn run_trace(
    config: SystemConfiguration,
    traffic: TrafficConfiguration,
    seed: u64,
) -> anyhow::Result<(Cycle, usize)> {
    let mut system = System::new(SystemConfiguration { seed, ..config })?;
    let mut driver = RandomTraffic::new(traffic, seed);
    let cycles = driver.run(&mut system, MAX_CYCLES)?;
    verify_completions(driver.log())?;
    Ok((cycles, driver.log().len()))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    for seed in 0..4 {
        let (cycles, accesses) = run_trace(small_caches(4, 2, 2), traffic(500, 48), seed)?;
        log::info!("seed {}: {} accesses in {} cycles", seed, accesses, cycles);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_bank_contention() {
        let _logger = env_logger::builder().is_test(true).try_init();
        for seed in 0..3 {
            // few lines, many cores: constant invalidation and recall traffic
            let (_, accesses) = run_trace(small_caches(4, 1, 1), traffic(300, 4), seed).unwrap();
            assert_eq!(accesses, 4 * 300);
        }
    }

    #[test]
    fn banked_with_replacements() {
        let _logger = env_logger::builder().is_test(true).try_init();
        for seed in 10..13 {
            run_trace(small_caches(4, 2, 2), traffic(400, 96), seed).unwrap();
        }
    }

    #[test]
    fn jittery_narrow_channels() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let mut config = small_caches(3, 2, 1);
        config.channel = ChannelConfiguration {
            capacity: 6,
            latency: 2,
            jitter: 3,
        };
        for seed in 20..23 {
            run_trace(config.clone(), traffic(300, 32), seed).unwrap();
        }
    }

    #[test]
    fn narrowest_channels_with_instruction_fetches() {
        let _logger = env_logger::builder().is_test(true).try_init();
        // lines bounce between the instruction and data arrays of 1-way L1s
        let mut config = small_caches(4, 1, 1);
        config.l1.icache = CacheGeometry::new(128, 1);
        config.l1.dcache = CacheGeometry::new(128, 1);
        config.channel = ChannelConfiguration {
            capacity: 2 * CHANNEL_RESERVE,
            latency: 1,
            jitter: 0,
        };
        let mut traffic = traffic(300, 16);
        traffic.ifetch_percent = 40;
        for seed in 50..56 {
            let (_, accesses) = run_trace(config.clone(), traffic.clone(), seed).unwrap();
            assert_eq!(accesses, 4 * 300);
        }
    }

    #[test]
    fn prefetch_and_eviction_reports() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let mut config = small_caches(2, 2, 2);
        config.l1.enable_prefetch = true;
        config.l1.send_evictions = true;
        let mut traffic = traffic(400, 40);
        traffic.ifetch_percent = 20;
        run_trace(config, traffic, 30).unwrap();
    }

    #[test]
    fn dma_alongside_cores() {
        let _logger = env_logger::builder().is_test(true).try_init();
        let mut config = small_caches(2, 2, 2);
        config.num_dma_ports = 1;
        config.full_system = true;
        let mut traffic = traffic(300, 16);
        traffic.dma_transfers = 60;
        for seed in 40..42 {
            let (_, accesses) = run_trace(config.clone(), traffic.clone(), seed).unwrap();
            assert!(accesses >= 2 * 300);
        }
    }
}
