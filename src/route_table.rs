//! Route table: compilation, matching, and copy-on-write mutation.
//!
//! Routes map an inbound `(method, path)` to a priced upstream endpoint.
//! Path patterns consist of literal segments and `:name` parameters; each
//! rule compiles to an anchored regex. Matching walks the compiled list in a
//! total, stable order — more segments first, then more literal segments,
//! then insertion order — so `/a/b/:x` beats `/a/:y/:z`.
//!
//! Mutations never patch the live table. `add`/`remove` build a fresh
//! [`CompiledTable`] and swap it in under a single writer lock; in-flight
//! requests keep the snapshot they captured at admission.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use url::Url;

use crate::usd::UsdAmount;

/// Upstream provider auth header injected on proxied requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderAuth {
    pub header: String,
    pub value: String,
}

/// The upstream a route forwards to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provider {
    pub id: String,
    pub backend_url: Url,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<ProviderAuth>,
}

/// A single route rule as persisted in the routes file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    pub method: String,
    pub path: String,
    pub tool_id: String,
    pub price: UsdAmount,
    pub provider: Provider,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub restricted: bool,
    /// Operator escape hatch: skip the SSRF guard for this rule.
    #[serde(default)]
    pub skip_ssrf: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("route path must start with '/': {0:?}")]
    PathNotAbsolute(String),
    #[error("invalid route pattern {path:?}: {source}")]
    InvalidPattern {
        path: String,
        #[source]
        source: regex::Error,
    },
    #[error("unknown tool id {0:?}")]
    UnknownToolId(String),
}

/// A route rule compiled for matching.
#[derive(Debug)]
pub struct CompiledRule {
    pub rule: RouteRule,
    regex: Regex,
    params: Vec<String>,
    segments: usize,
    literals: usize,
    seq: usize,
}

impl CompiledRule {
    fn compile(rule: RouteRule, seq: usize) -> Result<Self, RouteError> {
        if !rule.path.starts_with('/') {
            return Err(RouteError::PathNotAbsolute(rule.path));
        }
        let mut pattern = String::from("^");
        let mut params = Vec::new();
        let mut segments = 0usize;
        let mut literals = 0usize;
        for segment in rule.path.split('/').skip(1) {
            segments += 1;
            pattern.push('/');
            if let Some(name) = segment.strip_prefix(':') {
                params.push(name.to_string());
                pattern.push_str("([^/]+)");
            } else {
                literals += 1;
                pattern.push_str(&regex::escape(segment));
            }
        }
        pattern.push('$');
        let regex = Regex::new(&pattern).map_err(|source| RouteError::InvalidPattern {
            path: rule.path.clone(),
            source,
        })?;
        Ok(CompiledRule {
            rule,
            regex,
            params,
            segments,
            literals,
            seq,
        })
    }

    /// Match a path against this rule, extracting `:name` parameters.
    fn capture(&self, path: &str) -> Option<HashMap<String, String>> {
        let captures = self.regex.captures(path)?;
        let params = self
            .params
            .iter()
            .zip(captures.iter().skip(1))
            .filter_map(|(name, capture)| {
                capture.map(|c| (name.clone(), c.as_str().to_string()))
            })
            .collect();
        Some(params)
    }
}

/// An immutable, match-ordered set of compiled rules.
#[derive(Debug, Default)]
pub struct CompiledTable {
    rules: Vec<Arc<CompiledRule>>,
}

impl CompiledTable {
    /// Compile a rule list into a match-ordered table.
    ///
    /// Later duplicates of a `tool_id` replace earlier ones, which makes
    /// replace-by-id a plain `add`.
    pub fn compile(rules: Vec<RouteRule>) -> Result<Self, RouteError> {
        let mut by_tool: Vec<Arc<CompiledRule>> = Vec::with_capacity(rules.len());
        for rule in rules {
            match by_tool.iter().position(|c| c.rule.tool_id == rule.tool_id) {
                Some(i) => {
                    let seq = by_tool[i].seq;
                    by_tool[i] = Arc::new(CompiledRule::compile(rule, seq)?);
                }
                None => {
                    let seq = by_tool.len();
                    by_tool.push(Arc::new(CompiledRule::compile(rule, seq)?));
                }
            }
        }
        let mut rules = by_tool;
        rules.sort_by(|a, b| {
            b.segments
                .cmp(&a.segments)
                .then(b.literals.cmp(&a.literals))
                .then(a.seq.cmp(&b.seq))
        });
        Ok(CompiledTable { rules })
    }

    /// Match `(method, path)` against the table, first hit wins.
    pub fn match_route(
        &self,
        method: &str,
        path: &str,
    ) -> Option<(Arc<CompiledRule>, HashMap<String, String>)> {
        let method = method.to_ascii_uppercase();
        self.rules
            .iter()
            .filter(|c| c.rule.method.eq_ignore_ascii_case(&method))
            .find_map(|c| c.capture(path).map(|params| (Arc::clone(c), params)))
    }

    pub fn get(&self, tool_id: &str) -> Option<&Arc<CompiledRule>> {
        self.rules.iter().find(|c| c.rule.tool_id == tool_id)
    }

    /// The rules in insertion order, as persisted.
    pub fn rules(&self) -> Vec<RouteRule> {
        let mut ordered: Vec<&Arc<CompiledRule>> = self.rules.iter().collect();
        ordered.sort_by_key(|c| c.seq);
        ordered.iter().map(|c| c.rule.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Observer notified after every table mutation.
///
/// The payment coordinator registers here so its compiled price list never
/// drifts from the main table.
pub trait RouteObserver: Send + Sync {
    fn routes_changed(&self, snapshot: &Arc<CompiledTable>);
}

/// The live route table: a swappable compiled snapshot plus observers.
pub struct RouteTable {
    current: RwLock<Arc<CompiledTable>>,
    observers: Mutex<Vec<Arc<dyn RouteObserver>>>,
}

impl RouteTable {
    pub fn new(table: CompiledTable) -> Self {
        Self {
            current: RwLock::new(Arc::new(table)),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Capture the current snapshot. Cheap; holds no lock afterwards.
    pub fn snapshot(&self) -> Arc<CompiledTable> {
        Arc::clone(&self.current.read().expect("route table lock poisoned"))
    }

    pub fn subscribe(&self, observer: Arc<dyn RouteObserver>) {
        observer.routes_changed(&self.snapshot());
        self.observers
            .lock()
            .expect("observer lock poisoned")
            .push(observer);
    }

    /// Add a rule (or atomically replace the rule with the same `tool_id`).
    pub fn add(&self, rule: RouteRule) -> Result<Arc<CompiledTable>, RouteError> {
        self.mutate(|mut rules| {
            if let Some(existing) = rules.iter_mut().find(|r| r.tool_id == rule.tool_id) {
                *existing = rule;
            } else {
                rules.push(rule);
            }
            rules
        })
    }

    /// Remove the rule with the given `tool_id`.
    pub fn remove(&self, tool_id: &str) -> Result<Arc<CompiledTable>, RouteError> {
        let present = self.snapshot().get(tool_id).is_some();
        if !present {
            return Err(RouteError::UnknownToolId(tool_id.to_string()));
        }
        self.mutate(|mut rules| {
            rules.retain(|r| r.tool_id != tool_id);
            rules
        })
    }

    /// Build a new compiled snapshot from the mutated rule list and swap it
    /// in. The write lock covers only the swap; compilation happens outside.
    fn mutate(
        &self,
        f: impl FnOnce(Vec<RouteRule>) -> Vec<RouteRule>,
    ) -> Result<Arc<CompiledTable>, RouteError> {
        let next = Arc::new(CompiledTable::compile(f(self.snapshot().rules()))?);
        {
            let mut current = self.current.write().expect("route table lock poisoned");
            *current = Arc::clone(&next);
        }
        for observer in self
            .observers
            .lock()
            .expect("observer lock poisoned")
            .iter()
        {
            observer.routes_changed(&next);
        }
        Ok(next)
    }
}
