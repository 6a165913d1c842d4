use anyhow::Result;
use runlab_runner::{
    Coordinator, Database, Experiment, Inputs, Outputs, RunContext, Table, TableDict, Upstream,
};
use serde_json::json;
use std::path::Path;

fn base_args(root: &Path) -> Vec<String> {
    vec!["--base-dir".to_string(), root.display().to_string()]
}

struct Recorder;

impl Experiment for Recorder {
    fn inputs(&self) -> Inputs {
        Inputs::new()
    }

    fn outputs(&self) -> Outputs {
        Outputs::new()
            .with("table1", TableDict::new())
            .with("table3", TableDict::new())
            .with(
                "table2",
                Table::new(&[("foo", "integer")]).database(Database::new("foobar.db")),
            )
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        let table1 = ctx.output_mut::<TableDict>("table1")?;
        table1.insert("foo", "bar");
        table1.insert("22", "14");
        let (columns, rows) = table1.table().value()?;
        assert_eq!(columns, vec!["key".to_string(), "value".to_string()]);
        assert!(rows.is_empty());
        ctx.output_mut::<TableDict>("table3")?.insert("ABCD", "foo");
        ctx.output::<Table>("table2")?.insert([("foo", json!(23))])?;
        Ok(())
    }
}

struct Reader;

impl Experiment for Reader {
    fn inputs(&self) -> Inputs {
        Inputs::new().with("se", Upstream::new(Recorder))
    }

    fn outputs(&self) -> Outputs {
        Outputs::new()
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<()> {
        let se = ctx.input::<Upstream<Recorder>>("se")?;
        let table1 = se.output::<TableDict>("table1")?;
        assert!(!table1.is_empty());
        assert_eq!(table1.get("foo"), Some("bar"));
        assert_eq!(se.output::<TableDict>("table3")?.get("ABCD"), Some("foo"));
        let (_, rows) = se.output::<Table>("table2")?.value()?;
        assert_eq!(rows, vec![vec![json!(23)]]);
        Ok(())
    }
}

#[test]
fn tables_persist_into_the_run_and_read_back_downstream() {
    let root = tempfile::tempdir().expect("tempdir");
    let recorded = Coordinator::new(Recorder)
        .execute_with(base_args(root.path()), &[])
        .expect("recorder")
        .expect("result");
    assert!(recorded.run_dir.join("sqlite3.db").is_file());
    assert!(recorded.run_dir.join("foobar.db").is_file());

    Coordinator::new(Reader)
        .execute_with(
            base_args(root.path()),
            &[("se", recorded.identifier.as_str())],
        )
        .expect("reader")
        .expect("result");

    let attached = Coordinator::reattach(Recorder, root.path(), &recorded.identifier)
        .expect("reattach");
    let table3 = attached.output::<TableDict>("table3").expect("table3");
    assert_eq!(table3.iter().collect::<Vec<_>>(), vec![("ABCD", "foo")]);
    assert_eq!(
        table3.table().table_name().expect("name"),
        "Recorder__table3"
    );
}
