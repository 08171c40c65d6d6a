use drover::{
    config::ReconcileConfig, platform::local::LocalPlatform, Backend, JobRequest, JobStatus,
    MemoryStore, Orchestrator, Platforms,
};
use rand::{rngs::StdRng, SeedableRng};
use std::{
    collections::BTreeSet,
    fs,
    thread::sleep,
    time::{Duration, Instant},
};

const SCRIPT: &str = "echo trial done\necho '0 0.5' >> metric_loss.log\n";

const SWEEP: &str = "
optimizer:
  name: sgd
hpsearch:
  type: random_uniform
  n_trials: 3
  desc: lr
  params:
    - param: optimizer.lr
      lo: 0.001
      hi: 0.1
";

#[test]
fn sweep_runs_every_trial_locally() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("train.sh"), SCRIPT).unwrap();

    let mut platforms = Platforms::new();
    platforms.register(
        Backend::Local,
        LocalPlatform::new(
            dir.path().join("output"),
            vec!["sh".into()],
            vec![dir.path().to_path_buf()],
        ),
    );
    let orchestrator = Orchestrator::new(MemoryStore::new(), platforms, ReconcileConfig::default());

    let ids = orchestrator
        .submit_sweep(
            JobRequest {
                name: "base".into(),
                backend: Backend::Local,
                script: "train.sh".into(),
                config: serde_yaml::from_str(SWEEP).unwrap(),
            },
            &mut StdRng::seed_from_u64(42),
        )
        .unwrap()
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();
    assert_eq!(ids.len(), 3);

    let deadline = Instant::now() + Duration::from_secs(20);
    loop {
        let report = orchestrator.reconcile().unwrap();
        assert!(report.failures.is_empty(), "{:?}", report.failures);

        let jobs = orchestrator.list(false).unwrap();
        if jobs.iter().all(|job| job.status.is_terminal()) {
            break;
        }
        assert!(Instant::now() < deadline, "trials did not finish: {jobs:?}");
        sleep(Duration::from_millis(50));
    }

    let jobs = orchestrator.list(false).unwrap();
    let mut draws = BTreeSet::new();

    for job in jobs.iter() {
        assert_eq!(job.status, JobStatus::Finished, "{}", job.name);
        assert!(job.name.starts_with("base_lr_"));
        assert_eq!(job.logs.get("out").map(String::as_str), Some("trial done\n"));
        assert_eq!(job.metrics.scalars["loss"], vec![(0, 0.5)]);

        let lr = job.config["optimizer"]["lr"].as_f64().unwrap();
        assert!((0.001..=0.1).contains(&lr), "{lr}");
        draws.insert(lr.to_bits());

        let written = fs::read_to_string(job.output_path.as_ref().unwrap().join("config.yaml")).unwrap();
        assert!(written.contains("is_child: true"));
    }
    assert_eq!(draws.len(), 3);
}

#[test]
fn cancelled_local_job_ends_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("slow.sh"), "sleep 30\n").unwrap();

    let mut platforms = Platforms::new();
    platforms.register(
        Backend::Local,
        LocalPlatform::new(
            dir.path().join("output"),
            vec!["sh".into()],
            vec![dir.path().to_path_buf()],
        ),
    );
    let orchestrator = Orchestrator::new(MemoryStore::new(), platforms, ReconcileConfig::default());

    let id = orchestrator
        .submit(JobRequest {
            name: "slow".into(),
            backend: Backend::Local,
            script: "slow.sh".into(),
            config: serde_yaml::from_str("a: 1\n").unwrap(),
        })
        .unwrap();
    assert_eq!(orchestrator.get(id).unwrap().unwrap().status, JobStatus::Running);

    orchestrator.cancel(id).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while orchestrator.get(id).unwrap().unwrap().status != JobStatus::Cancelled {
        assert!(Instant::now() < deadline);
        orchestrator.reconcile().unwrap();
        sleep(Duration::from_millis(50));
    }

    orchestrator.archive(id).unwrap();
    assert!(orchestrator.list(false).unwrap().is_empty());
    assert_eq!(orchestrator.list(true).unwrap().len(), 1);
}
