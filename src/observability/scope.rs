//! ObservationScope for paired begin/complete logging
//!
//! Long-running maintenance operations (clear, integrity verification,
//! defragmentation, mirror verification) are wrapped in a scope so that every
//! `_BEGIN` line is matched by `_COMPLETE`, `_FAILED` or `_INCOMPLETE`.

use std::time::Instant;

use super::logger::Logger;

/// A scope that logs `{name}_BEGIN` on creation and one terminal event.
///
/// ```ignore
/// let scope = ObservationScope::with_fields("DEFRAGMENT", &[("db", path)]);
/// run_vacuum()?;
/// scope.complete();
/// ```
///
/// A scope dropped without `complete`/`fail` logs `{name}_INCOMPLETE` at WARN,
/// which is what an early `?` return looks like in the log.
pub struct ObservationScope {
    name: String,
    fields: Vec<(String, String)>,
    started: Instant,
    finished: bool,
}

impl ObservationScope {
    /// Create a new observation scope and log `{name}_BEGIN`
    pub fn new(name: &str) -> Self {
        Self::with_fields(name, &[])
    }

    /// Create a new observation scope carrying fields on every line
    pub fn with_fields(name: &str, fields: &[(&str, &str)]) -> Self {
        Logger::info(&format!("{}_BEGIN", name), fields);
        Self {
            name: name.to_string(),
            fields: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            started: Instant::now(),
            finished: false,
        }
    }

    fn field_refs<'a>(&'a self, elapsed: &'a str) -> Vec<(&'a str, &'a str)> {
        let mut refs: Vec<(&str, &str)> = self
            .fields
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        refs.push(("elapsed_ms", elapsed));
        refs
    }

    /// Returns milliseconds since the scope began
    pub fn elapsed_ms(&self) -> u128 {
        self.started.elapsed().as_millis()
    }

    /// Log `{name}_COMPLETE` at INFO
    pub fn complete(self) {
        self.complete_with_fields(&[]);
    }

    /// Log `{name}_COMPLETE` at INFO with extra fields
    pub fn complete_with_fields(mut self, extra: &[(&str, &str)]) {
        self.finished = true;
        let elapsed = self.elapsed_ms().to_string();
        let mut fields = self.field_refs(&elapsed);
        fields.extend(extra.iter().copied());
        Logger::info(&format!("{}_COMPLETE", self.name), &fields);
    }

    /// Log `{name}_FAILED` at ERROR
    pub fn fail(mut self, reason: &str) {
        self.finished = true;
        let elapsed = self.elapsed_ms().to_string();
        let mut fields = self.field_refs(&elapsed);
        fields.push(("reason", reason));
        Logger::error(&format!("{}_FAILED", self.name), &fields);
    }

    /// Log `{name}_FAILED` at FATAL
    pub fn fail_fatal(mut self, reason: &str) {
        self.finished = true;
        let elapsed = self.elapsed_ms().to_string();
        let mut fields = self.field_refs(&elapsed);
        fields.push(("reason", reason));
        Logger::fatal(&format!("{}_FAILED", self.name), &fields);
    }

    /// Whether a terminal event has been logged
    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

impl Drop for ObservationScope {
    fn drop(&mut self) {
        if !self.finished {
            let elapsed = self.elapsed_ms().to_string();
            let mut fields = self.field_refs(&elapsed);
            fields.push(("reason", "scope dropped without completion"));
            Logger::warn(&format!("{}_INCOMPLETE", self.name), &fields);
        }
    }
}
