use reddit_hybrid::{export_all, init_tracing_once, MigrateOptions, RedditMigration, RunOutcome};
use std::process::ExitCode;

fn main() -> ExitCode {
    init_tracing_once();

    let opts = match MigrateOptions::from_env() {
        Ok(o) => o,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(2);
        }
    };
    let hw = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(8);
    let parallelism = opts.parallelism.unwrap_or(hw);

    let migration = RedditMigration::from_options(opts).parallelism(parallelism);
    match migration.execute() {
        Ok((report, store)) => {
            if report.outcome == RunOutcome::CompletedWithIntegrityErrors {
                println!("Completed with integrity errors (see log); exit status stays 0");
            }
            if report.cancelled {
                println!("Run was cancelled before all streams finished");
            }
            let opts = migration.options();
            if let Some(dir) = &opts.export_dir {
                if let Err(e) = export_all(store.as_ref(), dir, opts.export_format) {
                    eprintln!("export failed: {e:#}");
                    return ExitCode::FAILURE;
                }
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}
