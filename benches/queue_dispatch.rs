use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use lazy_viewer::engine::Notification;
use lazy_viewer::{DataMask, EngineConfig, Image, Job, JobQueue, Transform};
use std::hint::black_box;
use std::time::Duration;

// Round trip through the single worker: submit, run, Finished on the channel
fn bench_submit_to_finished(c: &mut Criterion) {
    let (queue, main) = match JobQueue::spawn(EngineConfig::default()) {
        Ok(pair) => pair,
        Err(e) => panic!("worker did not start: {e}"),
    };

    c.bench_function("model_job_round_trip", |b| {
        b.iter(|| {
            let job = Job::model(Vec::new());
            queue.submit(&job);
            loop {
                match main.recv_timeout(Duration::from_secs(5)) {
                    Some(Notification::Finished(done)) if done.id() == job.id() => break,
                    Some(_) => {}
                    None => panic!("job never finished"),
                }
            }
            black_box(job.progress())
        })
    });

    // A burst of jobs spread over every lane, drained in priority order
    c.bench_function("mixed_lane_burst_64", |b| {
        b.iter_batched(
            || {
                let image = Image::new("/nonexistent/bench.png");
                (0..64)
                    .map(|i| match i % 4 {
                        0 => Job::load(image.clone(), DataMask::empty()),
                        1 => Job::transform(Vec::new(), Transform::Rotate90),
                        2 => Job::save(Vec::new()),
                        _ => Job::copy(Vec::new(), "/tmp"),
                    })
                    .collect::<Vec<_>>()
            },
            |jobs| {
                for job in &jobs {
                    queue.submit(job);
                }
                for job in &jobs {
                    job.wait();
                }
                main.dispatch_pending(|n| {
                    black_box(n);
                });
            },
            BatchSize::SmallInput,
        )
    });

    queue.shutdown();
}

criterion_group!(queue_dispatch, bench_submit_to_finished);
criterion_main!(queue_dispatch);
