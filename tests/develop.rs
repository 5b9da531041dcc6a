use std::fs;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use kumiki::{
    Document, DocumentOptions, Error, ExecutionContext, Graph, Product, SourceContainer,
    SourceFormat, TAG_INJECTED, Task,
};

fn tempdir() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::try_from(dir.path().to_path_buf()).unwrap();
    (dir, path)
}

fn noop(_: &mut Document, _: &ExecutionContext) -> anyhow::Result<()> {
    Ok(())
}

fn graph(dir: &Utf8Path, code: &str) -> Graph {
    fs::write(dir.join("nb.py"), code).unwrap();

    let mut graph = Graph::default();
    let task = Task::document(
        "nb",
        SourceContainer::file(dir.join("nb.py")).unwrap(),
        Product::file(dir.join("nb.ipynb")),
        Arc::new(noop),
    )
    .unwrap()
    .with_param("alpha", 1);
    graph.add(task).unwrap();
    graph
}

#[test]
fn unchanged_document_is_not_written() {
    let (_guard, dir) = tempdir();
    let mut graph = graph(&dir, "print(1)\n");
    let before = fs::metadata(dir.join("nb.py")).unwrap().modified().unwrap();

    let opened = Arc::new(Mutex::new(None));
    let editor = {
        let opened = opened.clone();
        move |path: &Utf8Path| -> anyhow::Result<()> {
            let document = Document::load(path)?;
            anyhow::ensure!(
                document.cells.iter().any(|cell| cell.has_tag(TAG_INJECTED)),
                "parameters are not injected"
            );
            *opened.lock().unwrap() = Some(path.to_path_buf());
            Ok(())
        }
    };

    assert!(!graph.develop("nb", &editor).unwrap());

    let after = fs::metadata(dir.join("nb.py")).unwrap().modified().unwrap();
    assert_eq!(before, after);
    assert_eq!(fs::read_to_string(dir.join("nb.py")).unwrap(), "print(1)\n");

    // the editable copy is gone once the session ends
    let path = opened.lock().unwrap().clone().unwrap();
    assert!(!path.exists());
    assert_eq!(path.extension(), Some("ipynb"));
}

#[test]
fn edits_are_written_back_without_parameters() {
    let (_guard, dir) = tempdir();
    let mut graph = graph(&dir, "print(1)\n");
    graph.build(false).unwrap();

    let editor = |path: &Utf8Path| -> anyhow::Result<()> {
        let mut document = Document::load(path)?;
        let last = document.cells.len() - 1;
        document.cells[last].source = "print(2)".into();
        fs::write(path, document.to_json()?)?;
        Ok(())
    };

    assert!(graph.develop("nb", &editor).unwrap());

    let source = fs::read_to_string(dir.join("nb.py")).unwrap();
    assert_eq!(source.trim(), "print(2)");
    assert!(!source.contains("alpha"));

    // the task was re-rendered against the new source
    let task = graph.task("nb").unwrap();
    assert!(task.staleness().unwrap().code);
}

#[test]
fn failing_editor_cleans_up() {
    let (_guard, dir) = tempdir();
    let mut graph = graph(&dir, "print(1)\n");

    let opened = Arc::new(Mutex::new(None));
    let editor = {
        let opened = opened.clone();
        move |path: &Utf8Path| -> anyhow::Result<()> {
            *opened.lock().unwrap() = Some(path.to_path_buf());
            anyhow::bail!("editor crashed")
        }
    };

    let err = graph.develop("nb", &editor).unwrap_err();
    assert!(err.to_string().contains("editor crashed"));

    let path = opened.lock().unwrap().clone().unwrap();
    assert!(!path.exists());
    assert_eq!(fs::read_to_string(dir.join("nb.py")).unwrap(), "print(1)\n");
}

#[test]
fn notebook_sources_stay_notebooks() {
    let (_guard, dir) = tempdir();

    let document = Document::from_script("print(1)\n", kumiki::Language::Python);
    fs::write(dir.join("nb.ipynb"), document.to_json().unwrap()).unwrap();

    let mut graph = Graph::default();
    let task = Task::document_with(
        "nb",
        SourceContainer::file(dir.join("nb.ipynb")).unwrap(),
        Product::file(dir.join("out/nb.html")),
        Arc::new(noop),
        DocumentOptions::default(),
    )
    .unwrap();
    graph.add(task).unwrap();

    let editor = |path: &Utf8Path| -> anyhow::Result<()> {
        let mut document = Document::load(path)?;
        document.cells.push(kumiki::Cell::code("print(3)"));
        fs::write(path, document.to_json()?)?;
        Ok(())
    };

    assert!(graph.develop("nb", &editor).unwrap());

    let stored = Document::load(&dir.join("nb.ipynb")).unwrap();
    let sources: Vec<_> = stored.cells.iter().map(|cell| cell.source.trim()).collect();
    assert_eq!(sources, vec!["print(1)", "print(3)"]);
    assert_eq!(
        graph.task("nb").unwrap().source().format(),
        SourceFormat::Notebook
    );
}

#[test]
fn only_documents_can_be_developed() {
    let (_guard, dir) = tempdir();
    let mut graph = Graph::default();
    graph
        .add(Task::callable("calc", "calc", Product::file(dir.join("x")), |_| Ok(())))
        .unwrap();

    let editor = |_: &Utf8Path| -> anyhow::Result<()> { Ok(()) };
    assert!(matches!(
        graph.develop("calc", &editor),
        Err(Error::Develop(kumiki::DevelopError::NotADocument(_)))
    ));
}
