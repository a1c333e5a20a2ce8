//! Whole-group runs of the π workload, in threads and in processes

use spmd::prelude::*;
use spmd::testing::{FaultPoint, FaultyTransport};
use spmd::{IsolationMode, LocalGroup, RoleRunner, RunOptions, Settings, run_threads};
use spmd_pi::darts::{rng_for, throw_darts};
use spmd_pi::{PiEstimate, TaskShare, manage, work};
use std::process::Command;
use std::sync::{Arc, Mutex};

/// Runs the real workload halves and keeps what each task saw.
#[derive(Clone, Default)]
struct Recorder {
    shares: Arc<Mutex<Vec<TaskShare>>>,
    estimate: Arc<Mutex<Option<PiEstimate>>>,
}

impl ManagerWorkload for Recorder {
    fn run_as_manager(
        &mut self,
        ctx: &GroupContext,
        ops: &CollectiveOps<'_>,
        args: &[String],
    ) -> Result<(), ErrorCode> {
        let estimate = manage(ctx, ops, args)?;
        self.shares.lock().unwrap().push(estimate.share);
        *self.estimate.lock().unwrap() = Some(estimate);
        Ok(())
    }
}

impl WorkerWorkload for Recorder {
    fn run_as_worker(
        &mut self,
        ctx: &GroupContext,
        ops: &CollectiveOps<'_>,
        _args: &[String],
    ) -> Result<(), ErrorCode> {
        let share = work(ctx, ops)?;
        self.shares.lock().unwrap().push(share);
        Ok(())
    }
}

impl Recorder {
    fn sorted_shares(&self) -> Vec<TaskShare> {
        let mut shares = self.shares.lock().unwrap().clone();
        shares.sort_by_key(|s| s.rank);
        shares
    }
}

fn thread_settings(tasks: usize) -> Settings {
    Settings {
        tasks,
        options: RunOptions::default(),
        isolation: IsolationMode::Thread,
        timeout: None,
        verbose: false,
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_four_tasks_split_evenly() {
    let recorder = Recorder::default();
    let codes = run_threads(
        &thread_settings(4),
        &args(&["-t", "1000", "-s", "1"]),
        recorder.clone(),
        recorder.clone(),
    );
    assert_eq!(codes, vec![0, 0, 0, 0]);

    let throws: Vec<u64> = recorder.sorted_shares().iter().map(|s| s.throws).collect();
    assert_eq!(throws, vec![250, 250, 250, 250]);

    let estimate = recorder.estimate.lock().unwrap().unwrap();
    let hits: u64 = recorder.sorted_shares().iter().map(|s| s.hits).sum();
    assert_eq!(estimate.total_hits, hits);
    assert_eq!(estimate.settings.total_throws, 1000);
}

#[test]
fn test_manager_absorbs_remainder() {
    let recorder = Recorder::default();
    let codes = run_threads(
        &thread_settings(3),
        &args(&["-t", "10"]),
        recorder.clone(),
        recorder.clone(),
    );
    assert_eq!(codes, vec![0, 0, 0]);

    let throws: Vec<u64> = recorder.sorted_shares().iter().map(|s| s.throws).collect();
    assert_eq!(throws, vec![4, 3, 3]);
    assert_eq!(throws.iter().sum::<u64>(), 10);
}

#[test]
fn test_work_sums_to_total_for_any_group_size() {
    for tasks in 1..=6 {
        let recorder = Recorder::default();
        let codes = run_threads(
            &thread_settings(tasks),
            &args(&["-t", "997"]),
            recorder.clone(),
            recorder.clone(),
        );
        assert!(codes.iter().all(|&c| c == 0), "tasks {tasks}: {codes:?}");
        let total: u64 = recorder.sorted_shares().iter().map(|s| s.throws).sum();
        assert_eq!(total, 997, "tasks {tasks}");
    }
}

#[test]
fn test_workers_use_the_broadcast_seed() {
    let recorder = Recorder::default();
    run_threads(
        &thread_settings(3),
        &args(&["-t", "3000", "-s", "77"]),
        recorder.clone(),
        recorder.clone(),
    );
    for share in recorder.sorted_shares() {
        let expected = throw_darts(&mut rng_for(Some(77), share.rank), share.throws);
        assert_eq!(share.hits, expected, "rank {}", share.rank);
    }
}

#[test]
fn test_nonzero_manager_rank() {
    let recorder = Recorder::default();
    let mut settings = thread_settings(3);
    settings.options.manager_rank = 2;
    let codes = run_threads(&settings, &args(&["-t", "10"]), recorder.clone(), recorder.clone());
    assert_eq!(codes, vec![0, 0, 0]);

    let throws: Vec<u64> = recorder.sorted_shares().iter().map(|s| s.throws).collect();
    assert_eq!(throws, vec![3, 3, 4]);
}

#[test]
fn test_missing_throw_count_fails_group() {
    let recorder = Recorder::default();
    let codes = run_threads(
        &thread_settings(3),
        &args(&["-t"]),
        recorder.clone(),
        recorder.clone(),
    );
    // The manager stops before broadcasting; workers lose their broadcast.
    assert_eq!(codes[0], ErrorCode::Args.code());
    assert!(codes[1..].iter().all(|&c| c == ErrorCode::Broadcast.code()));
    assert!(recorder.estimate.lock().unwrap().is_none());
}

#[test]
fn test_missing_throw_count_skips_collectives() {
    let endpoint = LocalGroup::new(1).pop().unwrap();
    let faulty = FaultyTransport::new(endpoint);
    let probe = faulty.probe();
    let recorder = Recorder::default();

    let status = RoleRunner::new(recorder.clone(), recorder).run(faulty, &args(&["-t"]));
    assert_eq!(status.error(), Some(ErrorCode::Args));
    assert_eq!(probe.count(FaultPoint::Broadcast), 0);
    assert_eq!(probe.count(FaultPoint::Reduce), 0);
    assert_eq!(probe.finalize_calls(), 1);
}

#[test]
fn test_launched_processes_report() {
    let output = Command::new(env!("CARGO_BIN_EXE_spmd-pi"))
        .args(["-n", "3", "--timeout", "120", "--", "-t", "3000", "-s", "5"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");

    let stdout = String::from_utf8_lossy(&output.stdout);
    for rank in 0..3 {
        assert!(
            stdout.contains(&format!("Task {rank} had ")),
            "missing rank {rank} in {stdout}"
        );
    }
    assert!(stdout.contains("out of 1000 throws"));
    assert!(stdout.contains("After 3000 throws..."));
    assert!(stdout.contains("API(1.0)"));
}

#[test]
fn test_launched_group_exits_with_manager_code() {
    let output = Command::new(env!("CARGO_BIN_EXE_spmd-pi"))
        .args(["-n", "2", "--timeout", "120", "--", "-t"])
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(i32::from(ErrorCode::Args.code())));
}

#[test]
fn test_thread_isolation_flag() {
    let output = Command::new(env!("CARGO_BIN_EXE_spmd-pi"))
        .args(["-n", "2", "--isolation", "thread", "--", "-t", "100"])
        .output()
        .unwrap();
    assert!(output.status.success(), "{output:?}");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("After 100 throws..."));
}
