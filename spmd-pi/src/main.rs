use spmd_pi::{PiManager, PiWorker};
use std::process::ExitCode;

fn main() -> anyhow::Result<ExitCode> {
    spmd::run(PiManager, PiWorker)
}
