use std::process::Command;

use anyhow::anyhow;

use crate::error::BuildError;
use crate::source::SourceContainer;
use crate::task::ExecutionContext;

const PREFIX: &str = "KUMIKI";

/// Runs the task source with `sh`.
///
/// Parameters and product locations are exported as environment variables:
/// `KUMIKI_PARAM_<NAME>`, `KUMIKI_PRODUCT` (or `KUMIKI_PRODUCT_<KEY>` for
/// keyed products) and `KUMIKI_UPSTREAM_<TASK>[_<KEY>]`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellTask;

fn env_name(parts: &[&str]) -> String {
    parts
        .iter()
        .map(|part| {
            part.chars()
                .map(|c| match c.is_ascii_alphanumeric() {
                    true => c.to_ascii_uppercase(),
                    false => '_',
                })
                .collect::<String>()
        })
        .collect::<Vec<_>>()
        .join("_")
}

impl ShellTask {
    pub(crate) fn env(context: &ExecutionContext) -> Vec<(String, String)> {
        let mut env = Vec::new();

        for (key, value) in &context.params {
            let value = match value {
                serde_json::Value::String(text) => text.clone(),
                value => value.to_string(),
            };
            env.push((env_name(&[PREFIX, "PARAM", key]), value));
        }

        for (key, path) in context.product.iter() {
            let name = match key {
                Some(key) => env_name(&[PREFIX, "PRODUCT", key]),
                None => env_name(&[PREFIX, "PRODUCT"]),
            };
            env.push((name, path.to_string()));
        }

        for (task, paths) in &context.upstream {
            for (key, path) in paths.iter() {
                let name = match key {
                    Some(key) => env_name(&[PREFIX, "UPSTREAM", task, key]),
                    None => env_name(&[PREFIX, "UPSTREAM", task]),
                };
                env.push((name, path.to_string()));
            }
        }

        env
    }

    pub(crate) fn run(
        &self,
        source: &mut SourceContainer,
        context: &ExecutionContext,
    ) -> Result<(), BuildError> {
        let script = source.read()?.to_string();

        let output = Command::new("sh")
            .arg("-e")
            .arg("-c")
            .arg(&script)
            .envs(Self::env(context))
            .output()?;

        for line in String::from_utf8_lossy(&output.stdout).lines() {
            tracing::debug!(task = %context.task, "{line}");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BuildError::Execution(anyhow!(
                "sh exited with {}:\n{}",
                output.status,
                stderr.trim_end()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use camino::Utf8PathBuf;

    use super::*;
    use crate::document::Language;
    use crate::product::ProductPaths;
    use crate::source::SourceFormat;

    fn context(product: Utf8PathBuf) -> ExecutionContext {
        ExecutionContext {
            task: "shell".into(),
            params: BTreeMap::from([
                ("greeting".to_string(), serde_json::json!("hello")),
                ("n".to_string(), serde_json::json!(3)),
            ]),
            product: ProductPaths::Single(product.clone()),
            upstream: BTreeMap::from([(
                "raw-data".to_string(),
                ProductPaths::Keyed(BTreeMap::from([("csv".to_string(), "raw.csv".into())])),
            )]),
            output: product,
        }
    }

    #[test]
    fn test_env_names() {
        let env: BTreeMap<_, _> = ShellTask::env(&context("out.txt".into())).into_iter().collect();

        assert_eq!(env["KUMIKI_PARAM_GREETING"], "hello");
        assert_eq!(env["KUMIKI_PARAM_N"], "3");
        assert_eq!(env["KUMIKI_PRODUCT"], "out.txt");
        assert_eq!(env["KUMIKI_UPSTREAM_RAW_DATA_CSV"], "raw.csv");
    }

    #[test]
    fn test_run_writes_product() {
        let dir = tempfile::tempdir().unwrap();
        let out = Utf8PathBuf::try_from(dir.path().join("out.txt")).unwrap();

        let mut source = SourceContainer::inline(
            "echo \"$KUMIKI_PARAM_GREETING $KUMIKI_PARAM_N\" > \"$KUMIKI_PRODUCT\"",
            SourceFormat::Script(Language::Shell),
        );
        ShellTask.run(&mut source, &context(out.clone())).unwrap();

        assert_eq!(fs::read_to_string(&out).unwrap(), "hello 3\n");
    }

    #[test]
    fn test_failure_reports_stderr() {
        let mut source =
            SourceContainer::inline("echo nope >&2; exit 2", SourceFormat::Script(Language::Shell));

        let err = ShellTask
            .run(&mut source, &context("out.txt".into()))
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
