//! Command implementations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use futures_util::{StreamExt, stream};
use harness::cancel::CancelToken;
use harness::core::identity::image_identity;
use harness::core::spec::EnvironmentSpec;
use harness::evaluate::{EvaluateOptions, default_run_id, prepare_instances, run_evaluate};
use harness::image::ImageOrchestrator;
use harness::io::config::{HarnessConfig, write_config};
use harness::io::dataset::{SpecOverride, load_predictions, load_records};
use harness::io::log_sink::LogPaths;
use harness::io::registry::Registry;
use harness::io::repo::GitSourceProvider;
use harness::io::runtime::DockerRuntime;
use harness::produce::{ProduceOptions, run_produce};
use harness::scheduler::Engine;
use tracing::{info, warn};

use crate::{BuildArgs, EvaluateArgs, ProduceArgs, split_words};

const LOG_ROOT: &str = "logs";

/// Token cancelled on the first Ctrl-C.
pub fn cancel_on_interrupt() -> CancelToken {
    let cancel = CancelToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling in-flight instances");
            token.cancel();
        }
    });
    cancel
}

pub fn config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(path, &HarnessConfig::default())?;
    println!("wrote {}", path.display());
    Ok(())
}

/// Docker runtime, git sources, and the optional registry behind one engine.
fn engine(cfg: &HarnessConfig, log_dir: &Path, cancel: CancelToken) -> Result<Engine> {
    let runtime = Arc::new(DockerRuntime::connect(&cfg.docker)?);
    let sources = Arc::new(GitSourceProvider::new(cfg.git.clone()));
    let mut images =
        ImageOrchestrator::new(runtime, sources, cfg.build.clone(), LogPaths::new(log_dir));
    if cfg.registry.enabled() {
        images = images.with_registry(Registry::new(cfg.registry.clone()));
    }
    Ok(Engine::new(Arc::new(images), cfg.run.clone()).with_cancel(cancel))
}

fn timeout_or_default(cfg: &HarnessConfig, secs: Option<u64>) -> Duration {
    secs.map(Duration::from_secs)
        .unwrap_or_else(|| cfg.run.timeout())
}

pub async fn evaluate(cfg: &HarnessConfig, args: EvaluateArgs, cancel: CancelToken) -> Result<()> {
    let records = load_records(&args.dataset)?;
    let predictions = if args.predictions == "gold" {
        None
    } else {
        Some(load_predictions(Path::new(&args.predictions))?)
    };
    let ids = split_words(args.instance_ids.as_deref());
    let prepared = prepare_instances(&records, ids.as_deref(), predictions.as_ref())?;

    let run_id = args.run_id.unwrap_or_else(default_run_id);
    let log_root = if args.use_tmp_dir {
        std::env::temp_dir().join("harness-logs")
    } else {
        PathBuf::from(LOG_ROOT)
    };
    let log_dir = log_root.join(&run_id);
    info!(
        run_id = %run_id,
        instances = prepared.instances.len(),
        rejected = prepared.rejected.len(),
        log_dir = %log_dir.display(),
        "starting evaluation"
    );

    let engine = engine(cfg, &log_dir, cancel)?;
    let opts = EvaluateOptions {
        run_id,
        log_dir,
        output_path: args.output_path,
        output_passed: args.output_passed,
        max_workers: args.max_workers,
        timeout: timeout_or_default(cfg, args.timeout),
        failfast: args.failfast,
        batch_mode: args.batch_mode,
        network_isolation: cfg.run.network_isolation,
        remove_images: args.remove_images,
    };
    let outcome = run_evaluate(&engine, &records, prepared, &opts).await?;

    let report = &outcome.report;
    println!("Total instances: {}", report.total);
    println!("Instances resolved: {}", report.resolved);
    println!("Instances unresolved: {}", report.unresolved);
    println!("Errors: {}", report.errors);
    println!("Report written to {}", outcome.report_path.display());
    Ok(())
}

pub async fn produce(cfg: &HarnessConfig, args: ProduceArgs, cancel: CancelToken) -> Result<()> {
    let mut records = load_records(&args.dataset)?;
    if let Some(arg) = &args.spec_dict {
        SpecOverride::parse(arg)?.apply(&mut records);
    }

    let opts = ProduceOptions {
        run_id: args.run_id.clone(),
        log_root: PathBuf::from(LOG_ROOT),
        output_path: args.output_path.clone(),
        output_passed: args.output_passed,
        max_workers: args.max_workers,
        timeout: timeout_or_default(cfg, args.timeout),
        batch_mode: args.batch(),
        black_list: split_words(args.black_list.as_deref()).unwrap_or_default(),
    };
    // Image build logs are shared by both rounds.
    let engine = engine(cfg, &opts.golden_log_dir(), cancel)?;
    let outcome = run_produce(&engine, &records, &opts).await?;

    let classified = outcome
        .classifications
        .values()
        .filter(|c| c.classification().is_some())
        .count();
    println!(
        "Classified {classified} of {} instances",
        outcome.classifications.len()
    );
    println!("Report written to {}", outcome.report_path.display());
    if let Some(path) = outcome.dataset_path {
        println!("Dataset written to {}", path.display());
    }
    Ok(())
}

pub async fn build(cfg: &HarnessConfig, args: BuildArgs, cancel: CancelToken) -> Result<()> {
    let targets = build_targets(&args)?;
    let log_dir = PathBuf::from(LOG_ROOT).join("build");
    let engine = engine(cfg, &log_dir, cancel)?;
    info!(images = targets.len(), "building images");

    let images = &engine.images;
    let force = args.force;
    let results: Vec<(String, Result<String, String>)> = stream::iter(targets)
        .map(|(repo, spec)| async move {
            let result = images
                .ensure_image(&repo, &spec, force)
                .await
                .map_err(|e| e.to_string());
            (repo, result)
        })
        .buffer_unordered(args.max_workers.max(1))
        .collect()
        .await;

    let mut failed = 0;
    for (repo, result) in results {
        match result {
            Ok(image) => println!("{repo}: {image}"),
            Err(err) => {
                failed += 1;
                eprintln!("{repo}: {err}");
            }
        }
    }
    if failed > 0 {
        bail!("{failed} image build(s) failed");
    }
    Ok(())
}

/// Distinct `(repo, spec)` pairs, one per image.
fn build_targets(args: &BuildArgs) -> Result<Vec<(String, EnvironmentSpec)>> {
    match (&args.dataset, &args.repo, &args.spec) {
        (Some(dataset), _, _) => {
            let mut by_image = BTreeMap::new();
            for record in load_records(dataset)? {
                let Some(spec) = record.spec_dict else {
                    warn!(instance_id = %record.instance_id, "record has no environment spec");
                    continue;
                };
                let image = image_identity(&record.repo, &spec).image_name;
                by_image.entry(image).or_insert((record.repo, spec));
            }
            Ok(by_image.into_values().collect())
        }
        (None, Some(repo), Some(spec)) => match SpecOverride::parse(spec).context("parse --spec")? {
            SpecOverride::All(spec) => Ok(vec![(repo.clone(), spec)]),
            SpecOverride::ByVersion(_) => bail!("--spec must be a single environment spec"),
        },
        _ => bail!("pass --dataset, or --repo together with --spec"),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn build_args(dataset: Option<PathBuf>, repo: Option<&str>, spec: Option<&str>) -> BuildArgs {
        BuildArgs {
            dataset,
            repo: repo.map(str::to_string),
            spec: spec.map(str::to_string),
            force: false,
            max_workers: 1,
        }
    }

    #[test]
    fn config_init_refuses_to_overwrite() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("harness.toml");
        config_init(&path, false).expect("first init");
        assert!(config_init(&path, false).is_err());
        config_init(&path, true).expect("forced init");
        let written = fs::read_to_string(&path).expect("read");
        assert!(written.contains("[run]"));
    }

    #[test]
    fn dataset_targets_are_deduplicated_by_image() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("data.jsonl");
        let row = |id: &str, test_cmd: &str| {
            format!(
                r#"{{"instance_id":"{id}","repo":"o/p","base_commit":"c","patch":"","test_patch":"","spec_dict":{{"python":"3.11","test_cmd":"{test_cmd}"}}}}"#
            )
        };
        let no_spec = r#"{"instance_id":"x","repo":"o/p","base_commit":"c","patch":"","test_patch":""}"#;
        fs::write(
            &path,
            [row("a", "pytest"), row("b", "pytest -x"), no_spec.to_string()].join("\n"),
        )
        .expect("write");

        let targets = build_targets(&build_args(Some(path), None, None)).expect("targets");
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].0, "o/p");
    }

    #[test]
    fn single_spec_target() {
        let args = build_args(None, Some("o/p"), Some(r#"{"python":"3.9","test_cmd":"pytest"}"#));
        let targets = build_targets(&args).expect("targets");
        assert_eq!(targets[0].1.python, "3.9");

        let versioned = build_args(None, Some("o/p"), Some(r#"{"1.0":{"python":"3.9"}}"#));
        assert!(build_targets(&versioned).is_err());
    }
}
