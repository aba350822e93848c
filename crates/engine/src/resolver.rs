//! Resource alias resolution.
//!
//! User prompts may reference registered resources as `@name` or
//! `@name(arg)`. Before LLM submission the resolver expands each unique
//! reference through its provider, under a per-call timeout and retry
//! policy. Short values substitute inline; long values collect into a
//! token-budgeted context section for the resources tier. `@@` escapes a
//! literal `@`.
//!
//! Failures follow the configured policy, in order: `fail_fast` aborts
//! the prompt, a per-alias `fallback` value substitutes in place of the
//! failed resolution, `skip_unresolved` drops the reference from the
//! output, and otherwise an `[unresolved: @name]` placeholder is left.
//! Every failure is recorded as an error entry regardless of the branch
//! taken.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use regex::Regex;

use ta_domain::config::ResolverConfig;
use ta_domain::error::{Error, Result};

use crate::context::estimator::TokenEstimator;

/// Values longer than this go to the context section instead of inline.
const INLINE_VALUE_MAX_CHARS: usize = 200;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Context handed to providers on every resolution.
#[derive(Debug, Clone, Default)]
pub struct ResolveContext {
    pub session_id: String,
    pub task: String,
    pub domain: String,
}

#[async_trait::async_trait]
pub trait AliasProvider: Send + Sync {
    async fn resolve(&self, ctx: &ResolveContext, arg: Option<&str>) -> Result<String>;
}

pub struct AliasDefinition {
    pub name: String,
    pub description: String,
    pub has_args: bool,
    /// Validation pattern for the argument, when `has_args`.
    pub arg_pattern: Option<Regex>,
    /// Substituted when resolution fails (the error is still recorded).
    pub fallback: Option<String>,
    pub provider: Arc<dyn AliasProvider>,
}

/// Copy-on-write alias registry: readers grab an `Arc` snapshot and never
/// block behind registration.
#[derive(Default)]
pub struct AliasRegistry {
    inner: RwLock<Arc<HashMap<String, Arc<AliasDefinition>>>>,
}

impl AliasRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, def: AliasDefinition) {
        let mut guard = self.inner.write();
        let mut next: HashMap<String, Arc<AliasDefinition>> = (**guard).clone();
        next.insert(def.name.clone(), Arc::new(def));
        *guard = Arc::new(next);
    }

    pub fn unregister(&self, name: &str) {
        let mut guard = self.inner.write();
        let mut next: HashMap<String, Arc<AliasDefinition>> = (**guard).clone();
        next.remove(name);
        *guard = Arc::new(next);
    }

    pub fn snapshot(&self) -> Arc<HashMap<String, Arc<AliasDefinition>>> {
        self.inner.read().clone()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().keys().cloned().collect();
        names.sort();
        names
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Resolution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AliasRef {
    pub name: String,
    pub arg: Option<String>,
}

impl AliasRef {
    pub fn display(&self) -> String {
        match &self.arg {
            Some(arg) => format!("@{}({arg})", self.name),
            None => format!("@{}", self.name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AliasError {
    pub name: String,
    pub message: String,
}

#[derive(Debug)]
pub struct ResolvedPrompt {
    /// The prompt with aliases expanded (or placeholdered).
    pub text: String,
    /// Long values, assembled for the resources tier. `None` when every
    /// value fit inline.
    pub context_section: Option<String>,
    pub resolved: Vec<AliasRef>,
    pub errors: Vec<AliasError>,
}

struct CachedValue {
    value: String,
    fetched_at: Instant,
}

pub struct AliasResolver {
    config: ResolverConfig,
    registry: Arc<AliasRegistry>,
    estimator: TokenEstimator,
    cache: Mutex<HashMap<AliasRef, CachedValue>>,
    token: Regex,
}

impl AliasResolver {
    pub fn new(config: ResolverConfig, registry: Arc<AliasRegistry>) -> Self {
        Self {
            config,
            registry,
            estimator: TokenEstimator::default(),
            cache: Mutex::new(HashMap::new()),
            // `@@` first so the escape wins over alias lexing; names are
            // greedy, so the longest registered name is matched naturally.
            token: Regex::new(r"@@|@([A-Za-z_][A-Za-z0-9_-]*)(?:\(([^)]*)\))?")
                .expect("static regex"),
        }
    }

    /// Lex a prompt for alias references, in order of appearance, without
    /// duplicates. Unregistered names are not references.
    pub fn find_aliases(&self, text: &str) -> Vec<AliasRef> {
        let registry = self.registry.snapshot();
        let mut seen = Vec::new();
        for capture in self.token.captures_iter(text) {
            let Some(name) = capture.get(1) else {
                continue; // the @@ escape
            };
            if !registry.contains_key(name.as_str()) {
                continue;
            }
            let alias = AliasRef {
                name: name.as_str().to_string(),
                arg: capture.get(2).map(|m| m.as_str().to_string()),
            };
            if !seen.contains(&alias) {
                seen.push(alias);
            }
        }
        seen
    }

    /// Expand every alias in `text`. Unique references resolve
    /// concurrently; results merge in order of appearance.
    ///
    /// `remaining_budget` bounds the context section via the configured
    /// budget ratio.
    pub async fn resolve_prompt(
        &self,
        text: &str,
        ctx: &ResolveContext,
        remaining_budget: u32,
    ) -> Result<ResolvedPrompt> {
        let aliases = self.find_aliases(text);
        let mut errors: Vec<AliasError> = Vec::new();
        let mut values: HashMap<AliasRef, String> = HashMap::new();

        // Validate args first; invalid references never hit providers.
        let registry = self.registry.snapshot();
        let mut to_resolve: Vec<AliasRef> = Vec::new();
        for alias in &aliases {
            let def = &registry[&alias.name];
            match (&alias.arg, def.has_args, &def.arg_pattern) {
                (Some(arg), true, Some(pattern)) if !pattern.is_match(arg) => {
                    errors.push(AliasError {
                        name: alias.name.clone(),
                        message: format!("argument '{arg}' does not match the expected pattern"),
                    });
                    if let Some(fallback) = &def.fallback {
                        values.insert(alias.clone(), fallback.clone());
                    }
                }
                (Some(_), false, _) => {
                    errors.push(AliasError {
                        name: alias.name.clone(),
                        message: "alias does not take an argument".into(),
                    });
                    if let Some(fallback) = &def.fallback {
                        values.insert(alias.clone(), fallback.clone());
                    }
                }
                _ => to_resolve.push(alias.clone()),
            }
        }

        // Serve from cache, resolve the rest concurrently.
        let mut pending: Vec<AliasRef> = Vec::new();
        {
            let cache = self.cache.lock();
            let ttl = Duration::from_millis(self.config.cache_ttl_ms);
            for alias in to_resolve {
                match cache.get(&alias) {
                    Some(cached) if cached.fetched_at.elapsed() < ttl => {
                        values.insert(alias, cached.value.clone());
                    }
                    _ => pending.push(alias),
                }
            }
        }

        let resolutions = join_all(pending.iter().map(|alias| {
            let def = registry[&alias.name].clone();
            async move {
                let result = self.resolve_one(&def, ctx, alias.arg.as_deref()).await;
                (alias.clone(), result)
            }
        }))
        .await;

        for (alias, result) in resolutions {
            match result {
                Ok(value) => {
                    self.cache.lock().insert(
                        alias.clone(),
                        CachedValue {
                            value: value.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                    values.insert(alias, value);
                }
                Err(e) => {
                    if self.config.fail_fast {
                        return Err(e);
                    }
                    tracing::warn!(alias = %alias.display(), error = %e, "alias resolution failed");
                    errors.push(AliasError {
                        name: alias.name.clone(),
                        message: e.to_string(),
                    });
                    // A configured fallback still gives the prompt a value.
                    if let Some(fallback) = &registry[&alias.name].fallback {
                        values.insert(alias, fallback.clone());
                    }
                }
            }
        }

        // Substitute in order of appearance; long values go to the
        // context section under the resource budget.
        let section_budget =
            (remaining_budget as f64 * self.config.resource_budget_ratio) as u32;
        let mut section_parts: Vec<String> = Vec::new();
        let mut section_tokens = 0u32;
        let mut resolved: Vec<AliasRef> = Vec::new();

        let out = self.token.replace_all(text, |capture: &regex::Captures<'_>| {
            let Some(name) = capture.get(1) else {
                return "@".to_string(); // @@ escape
            };
            let alias = AliasRef {
                name: name.as_str().to_string(),
                arg: capture.get(2).map(|m| m.as_str().to_string()),
            };
            match values.get(&alias) {
                Some(value) => {
                    if !resolved.contains(&alias) {
                        resolved.push(alias.clone());
                    }
                    if value.len() <= INLINE_VALUE_MAX_CHARS {
                        value.clone()
                    } else {
                        let tokens = self.estimator.estimate_text(value);
                        if section_tokens + tokens <= section_budget {
                            section_tokens += tokens;
                            section_parts
                                .push(format!("### {}\n{value}", alias.display()));
                        } else {
                            section_parts.push(format!(
                                "### {}\n[omitted: over resource budget]",
                                alias.display()
                            ));
                        }
                        format!("{} (see resources)", name.as_str())
                    }
                }
                None => {
                    if registry.contains_key(name.as_str()) {
                        if self.config.skip_unresolved {
                            String::new()
                        } else {
                            format!("[unresolved: @{}]", name.as_str())
                        }
                    } else {
                        capture[0].to_string()
                    }
                }
            }
        });

        let context_section = if section_parts.is_empty() {
            None
        } else {
            Some(format!("## Resources\n{}", section_parts.join("\n\n")))
        };

        Ok(ResolvedPrompt {
            text: out.into_owned(),
            context_section,
            resolved,
            errors,
        })
    }

    async fn resolve_one(
        &self,
        def: &AliasDefinition,
        ctx: &ResolveContext,
        arg: Option<&str>,
    ) -> Result<String> {
        let timeout = Duration::from_millis(self.config.timeout_ms);
        let mut last_err: Option<Error> = None;
        for attempt in 0..=self.config.max_retries {
            match tokio::time::timeout(timeout, def.provider.resolve(ctx, arg)).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => last_err = Some(e),
                Err(_) => {
                    last_err = Some(Error::Other(format!(
                        "alias '@{}' timed out after {}ms",
                        def.name, self.config.timeout_ms
                    )))
                }
            }
            tracing::debug!(alias = %def.name, attempt, "alias resolution retrying");
        }
        Err(last_err.unwrap_or_else(|| Error::Other("alias resolution failed".into())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProvider(String);

    #[async_trait::async_trait]
    impl AliasProvider for FixedProvider {
        async fn resolve(&self, _ctx: &ResolveContext, arg: Option<&str>) -> Result<String> {
            match arg {
                Some(arg) => Ok(format!("{} [{arg}]", self.0)),
                None => Ok(self.0.clone()),
            }
        }
    }

    struct FailingProvider;

    #[async_trait::async_trait]
    impl AliasProvider for FailingProvider {
        async fn resolve(&self, _ctx: &ResolveContext, _arg: Option<&str>) -> Result<String> {
            Err(Error::Other("backend unavailable".into()))
        }
    }

    fn registry_with(defs: Vec<AliasDefinition>) -> Arc<AliasRegistry> {
        let registry = AliasRegistry::new();
        for def in defs {
            registry.register(def);
        }
        Arc::new(registry)
    }

    fn def(name: &str, provider: Arc<dyn AliasProvider>) -> AliasDefinition {
        AliasDefinition {
            name: name.into(),
            description: format!("the {name} resource"),
            has_args: false,
            arg_pattern: None,
            fallback: None,
            provider,
        }
    }

    fn resolver(registry: Arc<AliasRegistry>) -> AliasResolver {
        AliasResolver::new(ResolverConfig::default(), registry)
    }

    #[tokio::test]
    async fn inline_substitution() {
        let registry = registry_with(vec![def(
            "selection",
            Arc::new(FixedProvider("3 rectangles".into())),
        )]);
        let r = resolver(registry);
        let out = r
            .resolve_prompt("align @selection to the left", &ResolveContext::default(), 10_000)
            .await
            .unwrap();
        assert_eq!(out.text, "align 3 rectangles to the left");
        assert_eq!(out.resolved.len(), 1);
        assert!(out.errors.is_empty());
        assert!(out.context_section.is_none());
    }

    #[tokio::test]
    async fn escape_disables_lexing() {
        let registry = registry_with(vec![def("x", Arc::new(FixedProvider("VALUE".into())))]);
        let r = resolver(registry);
        let out = r
            .resolve_prompt("email me @@x not @x", &ResolveContext::default(), 10_000)
            .await
            .unwrap();
        assert_eq!(out.text, "email me @x not VALUE");
    }

    #[tokio::test]
    async fn unregistered_names_pass_through() {
        let registry = registry_with(vec![]);
        let r = resolver(registry);
        let out = r
            .resolve_prompt("ping @nobody here", &ResolveContext::default(), 10_000)
            .await
            .unwrap();
        assert_eq!(out.text, "ping @nobody here");
        assert!(out.resolved.is_empty());
    }

    #[tokio::test]
    async fn failure_becomes_placeholder() {
        let registry = registry_with(vec![def("broken", Arc::new(FailingProvider))]);
        let r = resolver(registry);
        let out = r
            .resolve_prompt("use @broken now", &ResolveContext::default(), 10_000)
            .await
            .unwrap();
        assert_eq!(out.text, "use [unresolved: @broken] now");
        assert_eq!(out.errors.len(), 1);
    }

    #[tokio::test]
    async fn fallback_value_substitutes_on_failure() {
        let registry = registry_with(vec![AliasDefinition {
            name: "selection".into(),
            description: "the selection resource".into(),
            has_args: false,
            arg_pattern: None,
            fallback: Some("the current selection".into()),
            provider: Arc::new(FailingProvider),
        }]);
        let r = resolver(registry);
        let out = r
            .resolve_prompt("move @selection left", &ResolveContext::default(), 10_000)
            .await
            .unwrap();
        assert_eq!(out.text, "move the current selection left");
        // The failure is still recorded.
        assert_eq!(out.errors.len(), 1);
    }

    #[tokio::test]
    async fn fallback_applies_to_invalid_arguments_too() {
        let registry = registry_with(vec![AliasDefinition {
            name: "element".into(),
            description: "an element by id".into(),
            has_args: true,
            arg_pattern: Some(Regex::new(r"^el-\d+$").unwrap()),
            fallback: Some("an unknown element".into()),
            provider: Arc::new(FixedProvider("element data".into())),
        }]);
        let r = resolver(registry);
        let out = r
            .resolve_prompt("inspect @element(nope)", &ResolveContext::default(), 10_000)
            .await
            .unwrap();
        assert_eq!(out.text, "inspect an unknown element");
        assert_eq!(out.errors.len(), 1);
    }

    #[tokio::test]
    async fn skip_drops_failed_aliases_from_output() {
        let registry = registry_with(vec![def("broken", Arc::new(FailingProvider))]);
        let r = AliasResolver::new(
            ResolverConfig {
                skip_unresolved: true,
                max_retries: 0,
                ..Default::default()
            },
            registry,
        );
        let out = r
            .resolve_prompt("use @broken now", &ResolveContext::default(), 10_000)
            .await
            .unwrap();
        assert_eq!(out.text, "use  now");
        assert!(!out.text.contains("unresolved"));
        assert_eq!(out.errors.len(), 1);
    }

    #[tokio::test]
    async fn fail_fast_aborts() {
        let registry = registry_with(vec![def("broken", Arc::new(FailingProvider))]);
        let r = AliasResolver::new(
            ResolverConfig {
                fail_fast: true,
                max_retries: 0,
                ..Default::default()
            },
            registry,
        );
        let err = r
            .resolve_prompt("use @broken now", &ResolveContext::default(), 10_000)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("backend unavailable"));
    }

    #[tokio::test]
    async fn arg_validation() {
        let registry = registry_with(vec![AliasDefinition {
            name: "element".into(),
            description: "an element by id".into(),
            has_args: true,
            arg_pattern: Some(Regex::new(r"^el-\d+$").unwrap()),
            fallback: None,
            provider: Arc::new(FixedProvider("element data".into())),
        }]);
        let r = resolver(registry);

        let ok = r
            .resolve_prompt("inspect @element(el-3)", &ResolveContext::default(), 10_000)
            .await
            .unwrap();
        assert_eq!(ok.text, "inspect element data [el-3]");

        let bad = r
            .resolve_prompt("inspect @element(nope)", &ResolveContext::default(), 10_000)
            .await
            .unwrap();
        assert_eq!(bad.errors.len(), 1);
        assert!(bad.text.contains("[unresolved: @element]"));
    }

    #[tokio::test]
    async fn long_values_go_to_context_section() {
        let registry = registry_with(vec![def(
            "history",
            Arc::new(FixedProvider("line of history\n".repeat(40))),
        )]);
        let r = resolver(registry);
        let out = r
            .resolve_prompt("summarize @history", &ResolveContext::default(), 10_000)
            .await
            .unwrap();
        assert!(out.text.contains("history (see resources)"));
        let section = out.context_section.unwrap();
        assert!(section.starts_with("## Resources"));
        assert!(section.contains("line of history"));
    }

    #[tokio::test]
    async fn duplicate_references_resolve_once() {
        let registry = registry_with(vec![def(
            "selection",
            Arc::new(FixedProvider("both boxes".into())),
        )]);
        let r = resolver(registry.clone());
        let out = r
            .resolve_prompt(
                "move @selection and color @selection",
                &ResolveContext::default(),
                10_000,
            )
            .await
            .unwrap();
        assert_eq!(out.text, "move both boxes and color both boxes");
        assert_eq!(out.resolved.len(), 1);
    }

    #[tokio::test]
    async fn cache_serves_within_ttl() {
        use std::sync::atomic::{AtomicU32, Ordering};

        struct CountingProvider(AtomicU32);

        #[async_trait::async_trait]
        impl AliasProvider for CountingProvider {
            async fn resolve(&self, _ctx: &ResolveContext, _arg: Option<&str>) -> Result<String> {
                let n = self.0.fetch_add(1, Ordering::SeqCst);
                Ok(format!("call {n}"))
            }
        }

        let provider = Arc::new(CountingProvider(AtomicU32::new(0)));
        let registry = registry_with(vec![def("counted", provider.clone())]);
        let r = resolver(registry);

        let first = r
            .resolve_prompt("@counted", &ResolveContext::default(), 10_000)
            .await
            .unwrap();
        let second = r
            .resolve_prompt("@counted", &ResolveContext::default(), 10_000)
            .await
            .unwrap();
        assert_eq!(first.text, "call 0");
        assert_eq!(second.text, "call 0");
        assert_eq!(provider.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registry_is_copy_on_write() {
        let registry = AliasRegistry::new();
        let before = registry.snapshot();
        registry.register(def("new", Arc::new(FixedProvider("v".into()))));
        // The old snapshot is untouched; a new one sees the entry.
        assert!(before.is_empty());
        assert_eq!(registry.snapshot().len(), 1);
    }
}
