// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! In-memory collaborators for engine tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    ApplyOutcome, BuildReport, BuildRunner, ClusterHandle, ClusterProvisioner, CodeScanner,
    Finding, ImageBuilder, ImageRef, ImageScanner, Invocation, ManifestApplier, ScanReport,
    SmokeTester,
};
use crate::environment::Environment;
use crate::errors::DeployflowError;
use crate::pipeline::{ArtifactValue, Severity, StepKind};

/// Records every call and fails the step kinds it is told to fail
#[derive(Debug, Default)]
pub(crate) struct FakeCollaborators {
    failing: HashSet<StepKind>,
    erroring: HashSet<StepKind>,
    scan_severity: Severity,
    deploy_delay: Duration,
    step_delays: HashMap<StepKind, Duration>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    teardowns: AtomicUsize,
    log: Mutex<Vec<String>>,
    deployed: Mutex<Vec<(String, String)>>,
    inputs: Mutex<HashMap<String, BTreeMap<String, ArtifactValue>>>,
}

impl FakeCollaborators {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Steps of this kind report failure
    pub(crate) fn failing(mut self, kind: StepKind) -> Self {
        self.failing.insert(kind);
        self
    }

    /// Steps of this kind return an infrastructure error
    pub(crate) fn erroring(mut self, kind: StepKind) -> Self {
        self.erroring.insert(kind);
        self
    }

    /// Every scan reports a finding of this severity
    pub(crate) fn with_scan_severity(mut self, severity: Severity) -> Self {
        self.scan_severity = severity;
        self
    }

    pub(crate) fn with_deploy_delay(mut self, delay: Duration) -> Self {
        self.deploy_delay = delay;
        self
    }

    /// Build, lint and test calls of this kind take `delay` to finish
    pub(crate) fn with_step_delay(mut self, kind: StepKind, delay: Duration) -> Self {
        self.step_delays.insert(kind, delay);
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn max_concurrent_deploys(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    /// `stage:kind` for every step call, in call order
    pub(crate) fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// `(environment, image)` for every successful deploy
    pub(crate) fn deployed(&self) -> Vec<(String, String)> {
        self.deployed.lock().unwrap().clone()
    }

    /// Artifacts handed to the `stage:kind` call
    pub(crate) fn inputs(&self, call: &str) -> Option<BTreeMap<String, ArtifactValue>> {
        self.inputs.lock().unwrap().get(call).cloned()
    }

    fn record(&self, invocation: &Invocation) -> Result<bool, DeployflowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let call = format!("{}:{}", invocation.stage, invocation.kind);
        self.inputs
            .lock()
            .unwrap()
            .insert(call.clone(), invocation.artifacts.clone());
        self.log.lock().unwrap().push(call);

        if self.erroring.contains(&invocation.kind) {
            return Err(DeployflowError::CollaboratorFailed {
                collaborator: invocation.collaborator.clone(),
                error: "connection refused".into(),
                help: None,
            });
        }
        Ok(!self.failing.contains(&invocation.kind))
    }

    fn scan_report(&self, invocation: &Invocation) -> Result<ScanReport, DeployflowError> {
        let passed = self.record(invocation)?;
        let severity = if passed {
            self.scan_severity
        } else {
            Severity::Critical
        };

        if severity == Severity::None {
            Ok(ScanReport::clean())
        } else {
            Ok(ScanReport::from_findings(vec![Finding {
                id: "FAKE-1".into(),
                severity,
                description: String::new(),
            }]))
        }
    }
}

#[async_trait]
impl BuildRunner for FakeCollaborators {
    async fn run(&self, invocation: &Invocation) -> Result<BuildReport, DeployflowError> {
        let passed = self.record(invocation)?;
        if let Some(delay) = self.step_delays.get(&invocation.kind) {
            tokio::time::sleep(*delay).await;
        }
        Ok(BuildReport {
            passed,
            summary: if passed { "ok".into() } else { "failed".into() },
            artifact: passed.then(|| format!("{} report", invocation.kind)),
        })
    }
}

#[async_trait]
impl CodeScanner for FakeCollaborators {
    async fn scan(&self, invocation: &Invocation) -> Result<ScanReport, DeployflowError> {
        self.scan_report(invocation)
    }
}

#[async_trait]
impl ImageBuilder for FakeCollaborators {
    async fn build(&self, invocation: &Invocation) -> Result<ImageRef, DeployflowError> {
        if self.record(invocation)? {
            Ok(ImageRef(format!("app:{}", invocation.commit)))
        } else {
            Err(DeployflowError::CollaboratorFailed {
                collaborator: invocation.collaborator.clone(),
                error: "image build failed".into(),
                help: None,
            })
        }
    }
}

#[async_trait]
impl ImageScanner for FakeCollaborators {
    async fn scan(
        &self,
        invocation: &Invocation,
        _image: &ImageRef,
    ) -> Result<ScanReport, DeployflowError> {
        self.scan_report(invocation)
    }
}

#[async_trait]
impl ClusterProvisioner for FakeCollaborators {
    async fn provision(
        &self,
        invocation: &Invocation,
        environment: &Environment,
    ) -> Result<ClusterHandle, DeployflowError> {
        Ok(ClusterHandle {
            environment: environment.name.clone(),
            id: format!("{}-{}", environment.name, invocation.run_id),
        })
    }

    async fn teardown(
        &self,
        _invocation: &Invocation,
        _cluster: &ClusterHandle,
    ) -> Result<(), DeployflowError> {
        self.teardowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl ManifestApplier for FakeCollaborators {
    async fn apply(
        &self,
        invocation: &Invocation,
        cluster: &ClusterHandle,
        image: &ImageRef,
        _replicas: u32,
    ) -> Result<ApplyOutcome, DeployflowError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.deploy_delay.is_zero() {
            tokio::time::sleep(self.deploy_delay).await;
        }

        let result = self.record(invocation);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let deployed = result?;

        if deployed {
            self.deployed
                .lock()
                .unwrap()
                .push((cluster.environment.clone(), image.0.clone()));
        }
        Ok(ApplyOutcome {
            deployed,
            message: format!("applied {} to {}", image, cluster.id),
        })
    }
}

#[async_trait]
impl SmokeTester for FakeCollaborators {
    async fn probe(
        &self,
        invocation: &Invocation,
        _cluster: &ClusterHandle,
        _endpoints: &[String],
    ) -> Result<bool, DeployflowError> {
        self.record(invocation)
    }
}
