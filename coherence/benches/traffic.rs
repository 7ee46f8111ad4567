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

use bencher::Bencher;
use bencher::{benchmark_group, benchmark_main};

use coherence::{
    Address, ChannelConfiguration, MachineId, Message, MessageChannel, MessageType,
    RandomTraffic, System, SystemConfiguration, TrafficConfiguration, VirtualNetwork,
};

const REQUESTS_PER_CORE: usize = 2000;
const MESSAGES: usize = 100_000;

fn run_traffic(bench: &mut Bencher, lines: usize) {
    let config = SystemConfiguration {
        num_cpus: 4,
        num_l2caches: 2,
        num_dirs: 2,
        ..Default::default()
    };
    let traffic = TrafficConfiguration {
        requests_per_core: REQUESTS_PER_CORE,
        lines,
        ..Default::default()
    };
    bench.iter(|| {
        let mut system = System::new(config.clone()).unwrap();
        let mut driver = RandomTraffic::new(traffic.clone(), 1);
        driver.run(&mut system, 10_000_000).unwrap()
    });
}

// mostly private lines
fn sparse_traffic(bench: &mut Bencher) {
    run_traffic(bench, 4096);
}

// a handful of lines shared by every core
fn contended_traffic(bench: &mut Bencher) {
    run_traffic(bench, 8);
}

fn channel_throughput(bench: &mut Bencher) {
    let config = ChannelConfiguration {
        capacity: 64,
        latency: 1,
        jitter: 2,
    };
    let map = coherence::AddressMap::new(64, 1, 1);
    bench.iter(|| {
        let mut channel = MessageChannel::new(&config, false, 0).unwrap();
        let mut received = 0;
        let mut now = 0;
        for i in 0..MESSAGES {
            let msg = Message::new(
                MessageType::GetS,
                map.line(Address((i % 256) as u64 * 64)),
                MachineId::l1(0),
                MachineId::l2(0),
                VirtualNetwork::Request,
            );
            while channel.send(msg.clone(), now).is_err() {
                now += 1;
                while channel.receive(now).is_some() {
                    received += 1;
                }
            }
        }
        received
    });
    bench.bytes = MESSAGES as u64;
}

benchmark_group!(benches, sparse_traffic, contended_traffic, channel_throughput);
benchmark_main!(benches);
