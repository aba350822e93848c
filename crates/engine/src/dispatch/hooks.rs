//! Hook pipeline for tool dispatch and session lifecycle.
//!
//! Hooks run in registration order. A `PreToolUse` hook may veto a call
//! with `proceed = false`; hook errors are logged and treated as
//! `proceed = true` so a broken hook never takes the engine down.
//! Registration is copy-on-write: dispatch never blocks behind it.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use ta_domain::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    SessionStart,
    PreToolUse,
    PostToolUse,
    PostToolUseFailure,
    SessionEnd,
}

/// What a hook sees. `input` is set for tool events; `result` only for
/// the post events.
pub struct HookContext<'a> {
    pub event: HookEvent,
    pub session_id: &'a str,
    pub tool_name: Option<&'a str>,
    pub input: Option<&'a Value>,
    pub result: Option<&'a Value>,
}

#[derive(Debug, Clone)]
pub struct HookDecision {
    pub proceed: bool,
    pub reason: Option<String>,
}

impl HookDecision {
    pub fn proceed() -> Self {
        Self {
            proceed: true,
            reason: None,
        }
    }

    pub fn block(reason: impl Into<String>) -> Self {
        Self {
            proceed: false,
            reason: Some(reason.into()),
        }
    }
}

#[async_trait::async_trait]
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    fn events(&self) -> &[HookEvent];

    async fn on_event(&self, ctx: &HookContext<'_>) -> Result<HookDecision>;
}

#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<Arc<Vec<Arc<dyn Hook>>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, hook: Arc<dyn Hook>) {
        let mut guard = self.hooks.write();
        let mut next: Vec<Arc<dyn Hook>> = (**guard).clone();
        next.push(hook);
        *guard = Arc::new(next);
    }

    /// Dispatch an event through the pipeline in registration order.
    /// The first explicit block wins; errors are logged and skipped.
    pub async fn dispatch(&self, ctx: &HookContext<'_>) -> HookDecision {
        let hooks = self.hooks.read().clone();
        for hook in hooks.iter() {
            if !hook.events().contains(&ctx.event) {
                continue;
            }
            match hook.on_event(ctx).await {
                Ok(decision) if !decision.proceed => {
                    tracing::info!(
                        hook = hook.name(),
                        tool = ctx.tool_name.unwrap_or("-"),
                        reason = decision.reason.as_deref().unwrap_or(""),
                        "hook blocked tool call"
                    );
                    return decision;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(hook = hook.name(), error = %e, "hook failed, continuing");
                }
            }
        }
        HookDecision::proceed()
    }

    pub fn len(&self) -> usize {
        self.hooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct RecordingHook {
        name: String,
        events: Vec<HookEvent>,
        calls: AtomicU32,
        decision: fn() -> HookDecision,
    }

    #[async_trait::async_trait]
    impl Hook for RecordingHook {
        fn name(&self) -> &str {
            &self.name
        }
        fn events(&self) -> &[HookEvent] {
            &self.events
        }
        async fn on_event(&self, _ctx: &HookContext<'_>) -> Result<HookDecision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((self.decision)())
        }
    }

    struct FailingHook;

    #[async_trait::async_trait]
    impl Hook for FailingHook {
        fn name(&self) -> &str {
            "failing"
        }
        fn events(&self) -> &[HookEvent] {
            &[HookEvent::PreToolUse]
        }
        async fn on_event(&self, _ctx: &HookContext<'_>) -> Result<HookDecision> {
            Err(ta_domain::error::Error::Other("hook exploded".into()))
        }
    }

    fn ctx(event: HookEvent) -> HookContext<'static> {
        HookContext {
            event,
            session_id: "s1",
            tool_name: Some("task_execute"),
            input: None,
            result: None,
        }
    }

    #[tokio::test]
    async fn first_block_wins() {
        let registry = HookRegistry::new();
        let allow = Arc::new(RecordingHook {
            name: "allow".into(),
            events: vec![HookEvent::PreToolUse],
            calls: AtomicU32::new(0),
            decision: HookDecision::proceed,
        });
        let deny = Arc::new(RecordingHook {
            name: "deny".into(),
            events: vec![HookEvent::PreToolUse],
            calls: AtomicU32::new(0),
            decision: || HookDecision::block("policy"),
        });
        let after = Arc::new(RecordingHook {
            name: "after".into(),
            events: vec![HookEvent::PreToolUse],
            calls: AtomicU32::new(0),
            decision: HookDecision::proceed,
        });
        registry.register(allow.clone());
        registry.register(deny.clone());
        registry.register(after.clone());

        let decision = registry.dispatch(&ctx(HookEvent::PreToolUse)).await;
        assert!(!decision.proceed);
        assert_eq!(decision.reason.as_deref(), Some("policy"));
        assert_eq!(allow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(deny.calls.load(Ordering::SeqCst), 1);
        // The pipeline short-circuited before the third hook.
        assert_eq!(after.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn hook_errors_do_not_block() {
        let registry = HookRegistry::new();
        registry.register(Arc::new(FailingHook));
        let decision = registry.dispatch(&ctx(HookEvent::PreToolUse)).await;
        assert!(decision.proceed);
    }

    #[tokio::test]
    async fn hooks_only_fire_for_their_events() {
        let registry = HookRegistry::new();
        let hook = Arc::new(RecordingHook {
            name: "session-only".into(),
            events: vec![HookEvent::SessionStart],
            calls: AtomicU32::new(0),
            decision: HookDecision::proceed,
        });
        registry.register(hook.clone());

        registry.dispatch(&ctx(HookEvent::PreToolUse)).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 0);
        registry.dispatch(&ctx(HookEvent::SessionStart)).await;
        assert_eq!(hook.calls.load(Ordering::SeqCst), 1);
    }
}
