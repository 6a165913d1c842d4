use anyhow::Result;
use runlab_runner::metadata::read_metadata;
use runlab_runner::{
    assert_metadata_common, assert_metadata_unique, search_run, search_runs, Coordinator,
    DeferredContext, Experiment, File, HarnessError, Inputs, Integer, List, Metadata, Outputs,
    RunContext, Selector, Str, Upstream,
};
use serde_json::json;
use std::fs;
use std::path::Path;

fn base_args(root: &Path) -> Vec<String> {
    vec!["--base-dir".to_string(), root.display().to_string()]
}

struct Producer;

impl Experiment for Producer {
    fn inputs(&self) -> Inputs {
        Inputs::new().with("key", Str::new("p"))
    }

    fn outputs(&self) -> Outputs {
        Outputs::new().with("data", File::new("data"))
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        let key = ctx.input::<Str>("key")?.get()?.clone();
        ctx.output_mut::<File>("data")?.write(format!("data-{}", key));
        Ok(())
    }
}

struct Consumer;

impl Experiment for Consumer {
    fn inputs(&self) -> Inputs {
        Inputs::new()
            .with("up", Upstream::new(Producer))
            .with("factor", Integer::new(2))
    }

    fn outputs(&self) -> Outputs {
        Outputs::new().with("result", File::new("result"))
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        let data = ctx
            .input::<Upstream<Producer>>("up")?
            .output::<File>("data")?
            .value()?
            .to_string();
        let factor = *ctx.input::<Integer>("factor")?.get()?;
        ctx.output_mut::<File>("result")?
            .write(format!("{} x{}", data, factor));
        Ok(())
    }
}

fn run_producer(root: &Path, key: &str) -> String {
    Coordinator::new(Producer)
        .execute_with(base_args(root), &[("key", key)])
        .expect("producer")
        .expect("result")
        .identifier
}

#[test]
fn bare_upstream_runs_first_and_feeds_the_identity() {
    let root = tempfile::tempdir().expect("tempdir");
    let consumer = Coordinator::new(Consumer)
        .execute_with(base_args(root.path()), &[])
        .expect("consumer")
        .expect("result");

    let producers: Vec<_> = fs::read_dir(root.path())
        .expect("list")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| n.starts_with("Producer-"))
        .collect();
    assert_eq!(producers.len(), 1);

    let metadata = read_metadata(&consumer.run_dir).expect("metadata");
    assert_eq!(metadata["up"], json!(producers[0]));
    assert_eq!(
        fs::read_to_string(consumer.run_dir.join("result")).expect("result"),
        "data-p x2"
    );

    let again = Coordinator::new(Consumer)
        .execute_with(base_args(root.path()), &[("up", producers[0].as_str())])
        .expect("explicit upstream")
        .expect("result");
    assert_eq!(again.identifier, consumer.identifier);
}

#[test]
fn upstream_choice_changes_the_downstream_identity() {
    let root = tempfile::tempdir().expect("tempdir");
    let a = run_producer(root.path(), "a");
    let b = run_producer(root.path(), "b");

    let with_a = Coordinator::new(Consumer)
        .execute_with(base_args(root.path()), &[("up", a.as_str())])
        .expect("a")
        .expect("result");
    let with_b = Coordinator::new(Consumer)
        .execute_with(base_args(root.path()), &[("up", b.as_str())])
        .expect("b")
        .expect("result");
    assert_ne!(with_a.identifier, with_b.identifier);
    assert_eq!(
        fs::read_to_string(with_b.run_dir.join("result")).expect("result"),
        "data-b x2"
    );

    let err = Coordinator::new(Consumer)
        .execute_with(base_args(root.path()), &[("up", "Producer-missing")])
        .expect_err("unknown upstream");
    assert!(matches!(
        err.downcast_ref::<HarnessError>(),
        Some(HarnessError::Reattach { .. })
    ));
}

#[test]
fn reattaching_a_consumer_reattaches_its_upstream() {
    let root = tempfile::tempdir().expect("tempdir");
    let producer = run_producer(root.path(), "z");
    let consumer = Coordinator::new(Consumer)
        .execute_with(base_args(root.path()), &[("up", producer.as_str()), ("factor", "7")])
        .expect("consumer")
        .expect("result");

    let attached = Coordinator::reattach(Consumer, root.path(), &consumer.identifier)
        .expect("reattach");
    let upstream = attached.input::<Upstream<Producer>>("up").expect("up");
    assert_eq!(upstream.identifier(), Some(producer.as_str()));
    assert_eq!(
        upstream
            .output::<File>("data")
            .expect("data")
            .value()
            .expect("value"),
        "data-z"
    );
    assert_eq!(attached.input::<Integer>("factor").expect("factor").value(), Some(&7));
}

struct Aggregate;

impl Experiment for Aggregate {
    fn inputs(&self) -> Inputs {
        Inputs::new()
            .with("key", Str::new("a"))
            .deferred("runs", |ctx: &DeferredContext<'_>| {
                let key = ctx.input::<Str>("key")?.get()?.clone();
                let wanted = Metadata::from([("key".to_string(), json!(key))]);
                let found = search_runs(ctx.root_dir(), || Producer, &Selector::Metadata(wanted))?;
                Ok(List::from_items(found.into_iter().map(Upstream::from_run).collect()))
            })
    }

    fn outputs(&self) -> Outputs {
        Outputs::new().with("summary", File::new("summary"))
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        let mut lines = Vec::new();
        for upstream in ctx.input::<List<Upstream<Producer>>>("runs")?.iter() {
            lines.push(upstream.output::<File>("data")?.value()?.to_string());
        }
        ctx.output_mut::<File>("summary")?.write(lines.join("\n"));
        Ok(())
    }
}

#[test]
fn deferred_inputs_collect_matching_runs() {
    let root = tempfile::tempdir().expect("tempdir");
    let a = run_producer(root.path(), "a");
    run_producer(root.path(), "b");

    let result = Coordinator::new(Aggregate)
        .execute_with(base_args(root.path()), &[])
        .expect("aggregate")
        .expect("result");
    let metadata = read_metadata(&result.run_dir).expect("metadata");
    assert_eq!(metadata["runs"], json!([a.clone()]));
    assert_eq!(metadata["runs-0"], json!(a));
    assert_eq!(
        fs::read_to_string(result.run_dir.join("summary")).expect("summary"),
        "data-a"
    );
}

#[test]
fn search_filters_by_metadata_and_predicate() {
    let root = tempfile::tempdir().expect("tempdir");
    let a = run_producer(root.path(), "a");
    run_producer(root.path(), "b");
    Coordinator::new(Consumer)
        .execute_with(base_args(root.path()), &[("up", a.as_str())])
        .expect("consumer");

    let all = search_runs(root.path(), || Producer, &Selector::Any).expect("all");
    assert_eq!(all.len(), 2);
    assert!(assert_metadata_unique("key", &all).is_ok());
    assert!(assert_metadata_common("key", &all).is_err());
    assert!(assert_metadata_common("experiment-version", &all).is_ok());

    let only_b = search_run(
        root.path(),
        || Producer,
        &Selector::predicate(|c: &Coordinator<Producer>| {
            c.input::<Str>("key").ok().and_then(|k| k.as_str()) == Some("b")
        }),
    )
    .expect("unique");
    assert_eq!(only_b.metadata()["key"], json!("b"));

    let err = search_run(root.path(), || Producer, &Selector::Any)
        .err()
        .expect("ambiguous");
    match err.downcast_ref::<HarnessError>() {
        Some(HarnessError::NotUnique { matches, .. }) => assert_eq!(matches.len(), 2),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn search_skips_runs_whose_upstream_is_gone() {
    let root = tempfile::tempdir().expect("tempdir");
    let kept = run_producer(root.path(), "kept");
    let lost = run_producer(root.path(), "lost");
    for upstream in [&kept, &lost] {
        Coordinator::new(Consumer)
            .execute_with(base_args(root.path()), &[("up", upstream.as_str())])
            .expect("consumer");
    }
    fs::remove_dir_all(root.path().join(&lost)).expect("remove upstream");

    let found = search_runs(root.path(), || Consumer, &Selector::Any).expect("search");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].metadata()["up"], json!(kept));

    let only = search_run(root.path(), || Consumer, &Selector::Any).expect("unique");
    assert_eq!(only.metadata()["up"], json!(kept));
}
