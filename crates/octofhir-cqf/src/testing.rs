//! Test doubles shared by the unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine;
use serde_json::{Value, json};

use crate::engine::{EvaluationContext, ExpressionEvaluator, ExpressionValue};
use crate::error::CompilerDiagnostic;
use crate::library_cache::LibraryCompiler;

/// Understands just enough CQL to produce library headers: `library`,
/// `include ... called ...` and `define` lines. Lines starting with `!` are
/// reported as syntax errors.
#[derive(Default)]
pub struct LineCompiler {
    pub compilations: AtomicUsize,
}

impl LineCompiler {
    pub fn count(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }
}

impl LibraryCompiler for LineCompiler {
    fn compile(&self, source: &str) -> Result<Value, Vec<CompilerDiagnostic>> {
        self.compilations.fetch_add(1, Ordering::SeqCst);
        let mut identifier = json!({});
        let mut includes = Vec::new();
        let mut statements = Vec::new();
        let mut errors = Vec::new();

        for (n, line) in source.lines().enumerate() {
            let words: Vec<&str> = line.split_whitespace().collect();
            match words.as_slice() {
                ["library", name, "version", version, ..] => {
                    identifier = json!({"id": name, "version": version.trim_matches('\'')});
                }
                ["library", name] => identifier = json!({"id": name}),
                ["include", path, "version", version, "called", alias] => includes.push(json!({
                    "localIdentifier": alias,
                    "path": path,
                    "version": version.trim_matches('\'')
                })),
                ["include", path, "called", alias] => {
                    includes.push(json!({"localIdentifier": alias, "path": path}))
                }
                ["define", rest @ ..] => {
                    let name = rest.join(" ");
                    let name = name.trim_end_matches(':').trim_matches('"');
                    statements.push(json!({"name": name}));
                }
                _ if line.starts_with('!') => errors.push(
                    CompilerDiagnostic::new(format!("Syntax error near '{}'", &line[1..]))
                        .at(n as u32 + 1, 1),
                ),
                _ => {}
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(json!({"library": {
            "identifier": identifier,
            "includes": {"def": includes},
            "statements": {"def": statements}
        }}))
    }
}

/// A Library resource carrying CQL source.
pub fn cql_library(id: &str, version: &str, source: &str) -> Value {
    json!({
        "resourceType": "Library",
        "id": id,
        "version": version,
        "content": [{
            "contentType": "text/cql",
            "data": base64::engine::general_purpose::STANDARD.encode(source)
        }]
    })
}

/// Answers from a fixed table keyed by expression and subject id.
/// Unlisted pairs evaluate to null; listed errors fail.
#[derive(Default)]
pub struct TableEvaluator {
    results: HashMap<(String, String), Result<ExpressionValue, String>>,
    pub calls: AtomicUsize,
}

impl TableEvaluator {
    #[must_use]
    pub fn answer(mut self, expression: &str, subject: &str, value: ExpressionValue) -> Self {
        self.results
            .insert((expression.into(), subject.into()), Ok(value));
        self
    }

    #[must_use]
    pub fn fail(mut self, expression: &str, subject: &str, message: &str) -> Self {
        self.results
            .insert((expression.into(), subject.into()), Err(message.into()));
        self
    }

    /// Same boolean for every listed subject.
    #[must_use]
    pub fn flag(self, expression: &str, subjects: &[(&str, bool)]) -> Self {
        subjects.iter().fold(self, |acc, (subject, value)| {
            acc.answer(expression, subject, ExpressionValue::Boolean(*value))
        })
    }
}

#[async_trait]
impl ExpressionEvaluator for TableEvaluator {
    async fn evaluate(
        &self,
        context: &EvaluationContext,
        expression: &str,
    ) -> anyhow::Result<ExpressionValue> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let subject = context.subject().unwrap_or_default().to_string();
        match self.results.get(&(expression.to_string(), subject)) {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(message)) => Err(anyhow::anyhow!("{message}")),
            None => Ok(ExpressionValue::Null),
        }
    }
}
