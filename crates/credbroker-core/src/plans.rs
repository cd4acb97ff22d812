use crate::simple::SimpleOperator;
use crate::{CoreError, Operator};
use credbroker_model::StorePaths;
use credbroker_store::CredentialStore;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Plan name to operator, fixed at startup.
#[derive(Clone, Default)]
pub struct PlanTable {
    operators: BTreeMap<String, Arc<dyn Operator>>,
}

impl PlanTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The plans this broker ships: just `simple`.
    pub fn standard(store: Arc<dyn CredentialStore>, paths: StorePaths) -> Self {
        let mut table = Self::new();
        table.register(Arc::new(SimpleOperator::new(store, paths)));
        table
    }

    /// Register `operator` under its own plan name, replacing any previous one.
    pub fn register(&mut self, operator: Arc<dyn Operator>) {
        self.operators
            .insert(operator.plan_name().to_owned(), operator);
    }

    pub fn get(&self, plan_name: &str) -> Result<&Arc<dyn Operator>, CoreError> {
        self.operators
            .get(plan_name)
            .ok_or_else(|| CoreError::UnknownPlan(plan_name.to_owned()))
    }

    pub fn contains(&self, plan_name: &str) -> bool {
        self.operators.contains_key(plan_name)
    }

    pub fn plan_names(&self) -> Vec<&str> {
        self.operators.keys().map(String::as_str).collect()
    }
}
