//   Copyright 2025 miprobe developers
//
//   Licensed under the Apache License, Version 2.0 (the "License");
//   you may not use this file except in compliance with the License.
//   You may obtain a copy of the License at
//
//       http://www.apache.org/licenses/LICENSE-2.0
//
//   Unless required by applicable law or agreed to in writing, software
//   distributed under the License is distributed on an "AS IS" BASIS,
//   WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//   See the License for the specific language governing permissions and
//   limitations under the License.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ndarray::Array2;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;

use miprobe::mi::bound::{EstimatorKind, MiBound, NonFinitePolicy};
use miprobe::mi::statnet::{positive_pairs, StatisticsNetwork};

const BATCH: usize = 128;

pub fn statnet_cross_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("statnet-cross-join");
    group.sample_size(50);

    let mut rng = StdRng::seed_from_u64(0);
    let net = StatisticsNetwork::new(10, 32, 256, 2, &mut rng).unwrap();
    let y = Array2::<f64>::random_using((BATCH, 10), StandardNormal, &mut rng);
    let z = Array2::<f64>::random_using((BATCH, 32), StandardNormal, &mut rng);
    let pairs = (0..BATCH).flat_map(|i| (0..BATCH).map(move |j| (i, j))).collect::<Vec<_>>();

    group.bench_function("forward", |b| {
        b.iter(|| net.score(black_box(y.view()), black_box(z.view()), &pairs).unwrap())
    });

    let scored = net.forward(y.view(), z.view(), &pairs).unwrap();
    let d_scores = scored.scores.mapv(|_| 1.0 / pairs.len() as f64);
    group.bench_function("backward", |b| {
        b.iter(|| net.backward(black_box(&scored), y.view(), z.view(), &pairs, d_scores.view()))
    });
}

pub fn bound_objectives(c: &mut Criterion) {
    let mut group = c.benchmark_group("bound-objective");
    group.sample_size(200);

    let mut rng = StdRng::seed_from_u64(1);
    let net = StatisticsNetwork::new(10, 32, 64, 1, &mut rng).unwrap();
    let y = Array2::<f64>::random_using((BATCH, 10), StandardNormal, &mut rng);
    let z = Array2::<f64>::random_using((BATCH, 32), StandardNormal, &mut rng);
    let t = net.score(y.view(), z.view(), &positive_pairs(BATCH)).unwrap();

    for kind in [
        EstimatorKind::DonskerVaradhan,
        EstimatorKind::InfoNce,
        EstimatorKind::InfoNceSampled,
        EstimatorKind::JensenShannon,
    ] {
        let mut bound = kind.build(128, NonFinitePolicy::SkipBatch).unwrap();
        let negatives = bound.negative_pairs(BATCH, &mut rng);
        let t2 = net.score(y.view(), z.view(), &negatives).unwrap();
        group.bench_function(kind.to_string(), |b| {
            b.iter(|| bound.objective(black_box(t.view()), black_box(t2.view())))
        });
    }
}

criterion_group!(benches, statnet_cross_join, bound_objectives);
criterion_main!(benches);
