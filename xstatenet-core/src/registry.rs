//! Named callables the interpreter binds against: actions, guards, and
//! invoked services. The registry is the only dynamic indirection in the
//! runtime; every name a chart references is checked here at bind time.

use crate::chart::MachineChart;
use crate::context::OrchestratedContext;
use crate::error::ChartError;
use crate::types::{ContextMap, Event};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything an action may touch while it runs: the machine's own context
/// map (exclusive), the triggering event, and the orchestration scratchpad
/// for deferred sends. Actions never reach another machine directly.
pub struct ActionScope<'a> {
    pub machine_id: &'a str,
    pub context: &'a mut ContextMap,
    pub event: &'a Event,
    pub orchestration: &'a OrchestratedContext,
    pub cancel: &'a CancellationToken,
}

pub type ActionFn =
    Arc<dyn for<'a> Fn(ActionScope<'a>) -> BoxFuture<'a, Result<(), String>> + Send + Sync>;

/// Guards are pure, synchronous predicates over the context and event.
pub type GuardFn = Arc<dyn Fn(&ContextMap, &Event) -> Result<bool, String> + Send + Sync>;

/// Input handed to an invoked service. Services run detached from the
/// machine's consumer task and report back through synthetic events.
pub struct ServiceArgs {
    pub machine_id: String,
    pub invoke_id: String,
    /// Snapshot of the context at invocation time plus the triggering event.
    pub input: Value,
    pub cancel: CancellationToken,
}

pub type ServiceFn =
    Arc<dyn Fn(ServiceArgs) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Lookup tables for named behavior.
#[derive(Clone, Default)]
pub struct Registry {
    actions: HashMap<String, ActionFn>,
    guards: HashMap<String, GuardFn>,
    services: HashMap<String, ServiceFn>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_action<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: for<'a> Fn(ActionScope<'a>) -> BoxFuture<'a, Result<(), String>>
            + Send
            + Sync
            + 'static,
    {
        let action: ActionFn = Arc::new(f);
        self.actions.insert(name.into(), action);
        self
    }

    /// Convenience for actions with no suspension point.
    pub fn add_sync_action<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut ContextMap, &Event, &OrchestratedContext) -> Result<(), String>
            + Send
            + Sync
            + 'static,
    {
        let f = Arc::new(f);
        let action: ActionFn = Arc::new(move |scope: ActionScope<'_>| {
            let f = f.clone();
            Box::pin(async move { f.as_ref()(scope.context, scope.event, scope.orchestration) })
        });
        self.actions.insert(name.into(), action);
        self
    }

    pub fn add_guard<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&ContextMap, &Event) -> Result<bool, String> + Send + Sync + 'static,
    {
        self.guards.insert(name.into(), Arc::new(f));
        self
    }

    pub fn add_service<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(ServiceArgs) -> BoxFuture<'static, Result<Value, String>> + Send + Sync + 'static,
    {
        self.services.insert(name.into(), Arc::new(f));
        self
    }

    pub fn lookup_action(&self, name: &str) -> Option<&ActionFn> {
        self.actions.get(name)
    }

    pub fn lookup_guard(&self, name: &str) -> Option<&GuardFn> {
        self.guards.get(name)
    }

    pub fn lookup_service(&self, name: &str) -> Option<&ServiceFn> {
        self.services.get(name)
    }

    /// Check every name the chart references. Called by
    /// `MachineChart::parse_with_registry` so a missing handler is a build
    /// failure, never an execution failure.
    pub fn validate_chart(&self, chart: &MachineChart) -> Result<(), ChartError> {
        for name in &chart.action_names {
            if !self.actions.contains_key(name) {
                return Err(ChartError::bind(format!(
                    "chart '{}' references unknown action '{name}'",
                    chart.id
                )));
            }
        }
        for name in &chart.guard_names {
            if !self.guards.contains_key(name) {
                return Err(ChartError::bind(format!(
                    "chart '{}' references unknown guard '{name}'",
                    chart.id
                )));
            }
        }
        for name in &chart.service_names {
            if !self.services.contains_key(name) {
                return Err(ChartError::bind(format!(
                    "chart '{}' references unknown service '{name}'",
                    chart.id
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("actions", &self.actions.len())
            .field("guards", &self.guards.len())
            .field("services", &self.services.len())
            .finish()
    }
}
