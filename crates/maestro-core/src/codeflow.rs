//! Source-tree code flow between the VMR and product repositories.
//!
//! Subscriptions with a source directory flow back (VMR to product repo);
//! with a target directory they flow forward (product repo into the VMR).
//! The git mechanics are external; the updater only needs these traits.

use async_trait::async_trait;
use maestro_state::{Build, Subscription};
use serde::{Deserialize, Serialize};

use crate::coherency::DependencyUpdate;
use crate::error::FlowResult;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeFlowResult {
    pub had_updates: bool,
    pub dependency_updates: Vec<DependencyUpdate>,
    /// Files left conflicted on the head branch.
    pub conflicted_files: Vec<String>,
}

#[async_trait]
pub trait VmrBackFlower: Send + Sync {
    /// Flow `build` of the VMR into the product repository on `head_branch`.
    async fn flow_back(
        &self,
        subscription: &Subscription,
        build: &Build,
        head_branch: &str,
    ) -> FlowResult<CodeFlowResult>;
}

#[async_trait]
pub trait VmrForwardFlower: Send + Sync {
    /// Flow `build` of a product repository into the VMR on `head_branch`.
    async fn flow_forward(
        &self,
        subscription: &Subscription,
        build: &Build,
        head_branch: &str,
    ) -> FlowResult<CodeFlowResult>;
}

pub mod fakes {
    //! Flowers returning a fixed result.

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    pub struct FakeFlower {
        result: Mutex<CodeFlowResult>,
        calls: Mutex<Vec<(String, i64)>>,
    }

    impl FakeFlower {
        pub fn returning(result: CodeFlowResult) -> Self {
            Self {
                result: Mutex::new(result),
                calls: Mutex::new(Vec::new()),
            }
        }

        /// `(head_branch, build_id)` of every call.
        pub fn calls(&self) -> Vec<(String, i64)> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }

        fn record(&self, head_branch: &str, build: &Build) -> CodeFlowResult {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push((head_branch.to_string(), build.id));
            }
            self.result.lock().map(|r| r.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl VmrBackFlower for FakeFlower {
        async fn flow_back(
            &self,
            _subscription: &Subscription,
            build: &Build,
            head_branch: &str,
        ) -> FlowResult<CodeFlowResult> {
            Ok(self.record(head_branch, build))
        }
    }

    #[async_trait]
    impl VmrForwardFlower for FakeFlower {
        async fn flow_forward(
            &self,
            _subscription: &Subscription,
            build: &Build,
            head_branch: &str,
        ) -> FlowResult<CodeFlowResult> {
            Ok(self.record(head_branch, build))
        }
    }
}
