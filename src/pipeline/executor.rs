// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Pipeline executor
//!
//! Executes a [`RunPlan`] stage by stage in topological order. Within a run
//! execution is sequential and deterministic; across runs, environment
//! stages are serialized by the deploy lock table.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use colored::Colorize;

use crate::collaborators::{ClusterHandle, Collaborators, ImageRef, Invocation, ScanReport};
use crate::environment::{DeployLocks, Environment};
use crate::errors::DeployflowError;
use crate::gate::{Approver, GateKeeper, GateState, ManualApprover};
use crate::pipeline::{
    Artifact, ArtifactStore, ArtifactValue, CancelSignal, PipelineRun, RunOutcome, RunPlan,
    SkipReason, Stage, StageOutcome, StageRecord, Step, StepKind, StepOutcome, StepRecord,
};
use crate::state::{promotion, StateStore};

/// Outcome of a single collaborator call
struct StepResult {
    passed: bool,
    message: String,
    artifact: Option<ArtifactValue>,
}

impl StepResult {
    fn passed(message: impl Into<String>) -> Self {
        Self {
            passed: true,
            message: message.into(),
            artifact: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: message.into(),
            artifact: None,
        }
    }

    fn with_artifact(mut self, artifact: ArtifactValue) -> Self {
        self.artifact = Some(artifact);
        self
    }
}

/// Clusters provisioned during a run, torn down when it ends
type Clusters = BTreeMap<String, (ClusterHandle, Invocation)>;

/// Pipeline executor
pub struct PipelineExecutor {
    collaborators: Collaborators,
    store: Arc<dyn StateStore>,
    gates: Arc<GateKeeper>,
    locks: Arc<DeployLocks>,
    approver: Arc<dyn Approver>,
    progress: bool,
}

impl PipelineExecutor {
    /// Create a new pipeline executor
    pub fn new(collaborators: Collaborators, store: Arc<dyn StateStore>) -> Self {
        Self {
            collaborators,
            store,
            gates: Arc::new(GateKeeper::default()),
            locks: Arc::new(DeployLocks::new()),
            approver: Arc::new(ManualApprover),
            progress: false,
        }
    }

    /// Hand new gates to this approver
    pub fn with_approver(mut self, approver: Arc<dyn Approver>) -> Self {
        self.approver = approver;
        self
    }

    /// Share a gate keeper with other components
    pub fn with_gate_keeper(mut self, gates: Arc<GateKeeper>) -> Self {
        self.gates = gates;
        self
    }

    /// Share a deploy lock table with other executors
    pub fn with_locks(mut self, locks: Arc<DeployLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Print stage progress to stdout
    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    pub fn gates(&self) -> &Arc<GateKeeper> {
        &self.gates
    }

    pub fn locks(&self) -> &Arc<DeployLocks> {
        &self.locks
    }

    /// Execute a plan to completion
    ///
    /// Step failures, rejected gates and cancellation are recorded in the
    /// returned run; only state store failures are errors.
    pub async fn execute(
        &self,
        plan: &RunPlan,
        cancel: CancelSignal,
    ) -> Result<PipelineRun, DeployflowError> {
        let start = Instant::now();
        let mut run = Self::new_run(plan);

        tracing::info!(
            run_id = %run.id,
            pipeline = %run.pipeline,
            branch = %run.branch,
            commit = %run.commit_sha,
            route = %plan.route,
            "run started"
        );

        let mut clusters = Clusters::new();
        let mut gate_results: HashMap<String, GateState> = HashMap::new();

        for (pos, stage) in plan.stages().enumerate() {
            if let Some(reason) = Self::skip_reason(plan, &run, stage) {
                self.skip(&mut run.stages[pos], reason);
                continue;
            }

            if cancel.is_cancelled() {
                run.cancelled = true;
                self.skip(&mut run.stages[pos], SkipReason::Cancelled);
                continue;
            }

            let environment = match &stage.environment {
                Some(name) => Some(plan.environments.require(name)?),
                None => None,
            };

            if let Some(env) = environment.filter(|env| env.requires_gate) {
                let state = match gate_results.get(&env.name) {
                    Some(state) => *state,
                    None => {
                        let state = self.resolve_gate(plan, &mut run, env, &cancel).await?;
                        gate_results.insert(env.name.clone(), state);
                        state
                    }
                };

                if state != GateState::Approved {
                    let reason = if cancel.is_cancelled() {
                        run.cancelled = true;
                        SkipReason::Cancelled
                    } else {
                        SkipReason::GateNotApproved {
                            environment: env.name.clone(),
                            state,
                        }
                    };
                    self.skip(&mut run.stages[pos], reason);
                    continue;
                }
            }

            // Gate waits hold no lock; the lock covers only the stage itself
            let _guard = match environment {
                Some(env) => match self.locks.acquire(&env.name, &run.id).await {
                    Ok(guard) => Some(guard),
                    Err(e) => {
                        self.teardown(clusters).await;
                        return Err(e);
                    }
                },
                None => None,
            };

            self.run_stage(plan, &mut run, pos, stage, &cancel, &mut clusters)
                .await;
        }

        self.teardown(clusters).await;

        let outcome = run.finish();
        self.store.save_run(&run).await?;

        match promotion::apply_promotions(self.store.as_ref(), &run).await {
            Ok(_) => {
                if run.overall_outcome == Some(RunOutcome::Succeeded) {
                    run.promotions_applied = true;
                }
            }
            // The saved run still carries its promotions; reconcile applies them
            Err(e) => tracing::error!(run_id = %run.id, error = %e, "failed to apply promotions"),
        }

        tracing::info!(
            run_id = %run.id,
            outcome = %outcome,
            duration_ms = start.elapsed().as_millis() as u64,
            "run finished"
        );

        if self.progress {
            println!();
            let summary = format!(
                "Run {} {} in {:.2}s",
                run.id,
                outcome,
                start.elapsed().as_secs_f64()
            );
            match outcome {
                RunOutcome::Succeeded => println!("{}", summary.green()),
                _ => println!("{}", summary.red()),
            }
        }

        Ok(run)
    }

    fn new_run(plan: &RunPlan) -> PipelineRun {
        let stages = plan
            .stages()
            .map(|stage| StageRecord {
                name: stage.name.clone(),
                environment: stage.environment.clone(),
                outcome: StageOutcome::Pending,
                steps: stage
                    .steps
                    .iter()
                    .map(|step| StepRecord::pending(step.kind, &step.collaborator))
                    .collect(),
                started_at: None,
                finished_at: None,
            })
            .collect();

        PipelineRun {
            id: uuid::Uuid::new_v4().to_string(),
            pipeline: plan.pipeline.name.clone(),
            commit_sha: plan.request.commit_sha.clone(),
            branch: plan.request.branch.clone(),
            route: plan.route.clone(),
            target_environments: plan.target_environments(),
            stages,
            gates: Vec::new(),
            artifacts: ArtifactStore::default(),
            cancelled: false,
            created_at: Utc::now(),
            finished_at: None,
            overall_outcome: None,
            promotions: Vec::new(),
            promotions_applied: false,
        }
    }

    /// Why a stage cannot start, judged from the plan and its dependencies
    fn skip_reason(plan: &RunPlan, run: &PipelineRun, stage: &Stage) -> Option<SkipReason> {
        if plan.is_branch_skipped(&stage.name) {
            return Some(SkipReason::BranchMismatch);
        }

        stage.depends_on.iter().find_map(|dep| {
            match run.stage(dep).map(|s| &s.outcome) {
                Some(StageOutcome::Succeeded) => None,
                Some(StageOutcome::Skipped(reason)) => Some(reason.clone()),
                _ => Some(SkipReason::UpstreamFailed { stage: dep.clone() }),
            }
        })
    }

    fn skip(&self, record: &mut StageRecord, reason: SkipReason) {
        tracing::info!(stage = %record.name, reason = %reason, "stage skipped");
        if self.progress {
            println!(
                "  {} {} {}",
                "⊘".dimmed(),
                record.name.dimmed(),
                format!("({})", reason).dimmed()
            );
        }
        record.skip(reason);
    }

    /// Open the environment's gate and wait for it to close
    async fn resolve_gate(
        &self,
        plan: &RunPlan,
        run: &mut PipelineRun,
        env: &Environment,
        cancel: &CancelSignal,
    ) -> Result<GateState, DeployflowError> {
        let timeout = Duration::from_secs(plan.pipeline.gate.timeout_secs);
        let gate = self.gates.request(&run.id, &env.name, Some(timeout)).await?;

        if self.progress {
            println!(
                "  {} waiting for approval to deploy to {} (gate {})",
                "⏸".yellow(),
                env.name.bold(),
                gate.id.dimmed()
            );
        }

        let review = {
            let approver = self.approver.clone();
            let gates = self.gates.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                if let Some(decision) = approver.review(&gate).await {
                    if let Err(e) = gates.decide(&gate.id, decision).await {
                        tracing::debug!(gate_id = %gate.id, error = %e, "approver decision not applied");
                    }
                }
            })
        };

        let resolved = self.gates.wait(&gate.id, cancel).await;
        review.abort();
        let resolved = resolved?;

        if self.progress {
            let state = match resolved.state {
                GateState::Approved => resolved.state.to_string().green(),
                _ => resolved.state.to_string().red(),
            };
            match &resolved.reason {
                Some(reason) => println!("  gate {}: {}", state, reason),
                None => println!("  gate {}", state),
            }
        }

        let state = resolved.state;
        run.gates.push(resolved);
        Ok(state)
    }

    /// Run every step of a stage strictly in order
    async fn run_stage(
        &self,
        plan: &RunPlan,
        run: &mut PipelineRun,
        pos: usize,
        stage: &Stage,
        cancel: &CancelSignal,
        clusters: &mut Clusters,
    ) {
        let stage_start = Instant::now();
        let base = Invocation {
            collaborator: String::new(),
            run_id: run.id.clone(),
            stage: stage.name.clone(),
            kind: StepKind::Build,
            commit: run.commit_sha.clone(),
            branch: run.branch.clone(),
            environment: stage.environment.clone(),
            artifacts: BTreeMap::new(),
        };

        let PipelineRun {
            stages,
            artifacts,
            cancelled,
            ..
        } = run;
        let record = &mut stages[pos];
        record.outcome = StageOutcome::Running;
        record.started_at = Some(Utc::now());

        if self.progress {
            println!("  {} {}", "→".blue(), stage.name);
        }

        for (idx, step) in stage.steps.iter().enumerate() {
            // An in-flight step always completes; cancellation applies between steps
            if cancel.is_cancelled() {
                *cancelled = true;
                record.finished_at = Some(Utc::now());
                self.skip(record, SkipReason::Cancelled);
                return;
            }

            record.steps[idx].started_at = Some(Utc::now());
            let result = match artifacts.resolve(&step.reads) {
                Ok(inputs) => {
                    let invocation = Invocation {
                        collaborator: step.collaborator.clone(),
                        kind: step.kind,
                        artifacts: inputs,
                        ..base.clone()
                    };
                    match self
                        .run_step(plan, stage, step, &invocation, artifacts, clusters)
                        .await
                    {
                        Ok(result) => result,
                        Err(e) => StepResult::failed(e.to_string()),
                    }
                }
                Err(missing) => StepResult::failed(
                    DeployflowError::missing_artifact(&stage.name, missing, None).to_string(),
                ),
            };
            let step_record = &mut record.steps[idx];
            step_record.finished_at = Some(Utc::now());

            if result.passed {
                tracing::debug!(stage = %stage.name, step = %step.kind, "step succeeded");
                if let (Some(name), Some(value)) = (&step.produces, result.artifact) {
                    artifacts.insert(Artifact {
                        name: name.clone(),
                        stage: stage.name.clone(),
                        step: idx,
                        value,
                    });
                    step_record.artifact = Some(name.clone());
                }
                step_record.outcome = StepOutcome::Succeeded {
                    message: result.message,
                };
            } else if step.is_blocking() {
                tracing::warn!(
                    stage = %stage.name,
                    step = %step.kind,
                    message = %result.message,
                    "step failed"
                );
                step_record.outcome = StepOutcome::Failed {
                    message: result.message.clone(),
                };
                for rest in &mut record.steps[idx + 1..] {
                    rest.outcome = StepOutcome::Skipped;
                }
                record.outcome = StageOutcome::Failed;
                record.finished_at = Some(Utc::now());

                if self.progress {
                    println!(
                        "  {} {} failed at {}: {}",
                        "✗".red(),
                        stage.name.bold(),
                        step.kind,
                        result.message.dimmed()
                    );
                }
                return;
            } else {
                tracing::warn!(
                    stage = %stage.name,
                    step = %step.kind,
                    message = %result.message,
                    "advisory scan failed; continuing"
                );
                step_record.advisory = true;
                step_record.outcome = StepOutcome::Failed {
                    message: result.message,
                };
            }
        }

        record.outcome = StageOutcome::Succeeded;
        record.finished_at = Some(Utc::now());

        if self.progress {
            println!(
                "  {} {} ({:.2}s)",
                "✓".green(),
                stage.name.bold(),
                stage_start.elapsed().as_secs_f64()
            );
        }
    }

    /// Call the collaborator for one step
    async fn run_step(
        &self,
        plan: &RunPlan,
        stage: &Stage,
        step: &Step,
        invocation: &Invocation,
        artifacts: &ArtifactStore,
        clusters: &mut Clusters,
    ) -> Result<StepResult, DeployflowError> {
        let c = &self.collaborators;

        match step.kind {
            StepKind::Build | StepKind::Lint | StepKind::Test => {
                let report = c.builds.run(invocation).await?;
                let result = if report.passed {
                    StepResult::passed(report.summary)
                } else {
                    StepResult::failed(report.summary)
                };
                Ok(match report.artifact {
                    Some(content) => result.with_artifact(ArtifactValue::Report(content)),
                    None => result,
                })
            }
            StepKind::SecurityScanCode => {
                let report = c.code_scanner.scan(invocation).await?;
                Self::scan_result(step, &report)
            }
            StepKind::BuildImage => {
                let image = c.image_builder.build(invocation).await?;
                Ok(StepResult::passed(format!("built {}", image))
                    .with_artifact(ArtifactValue::Image(image)))
            }
            StepKind::ScanImage => {
                let image = Self::read_image(stage, step, artifacts)?;
                let report = c.image_scanner.scan(invocation, image).await?;
                Self::scan_result(step, &report)
            }
            StepKind::Deploy => {
                let env = Self::step_environment(plan, stage)?;
                let image = Self::read_image(stage, step, artifacts)?;

                let cluster = match clusters.get(&env.name) {
                    Some((cluster, _)) => cluster.clone(),
                    None => {
                        let provision = Invocation {
                            collaborator: env
                                .provisioner
                                .clone()
                                .unwrap_or_else(|| invocation.collaborator.clone()),
                            ..invocation.clone()
                        };
                        let cluster = c.provisioner.provision(&provision, env).await?;
                        tracing::info!(environment = %env.name, cluster = %cluster.id, "cluster provisioned");
                        clusters.insert(env.name.clone(), (cluster.clone(), provision));
                        cluster
                    }
                };

                let outcome = c
                    .applier
                    .apply(invocation, &cluster, image, env.replicas)
                    .await?;
                if outcome.deployed {
                    tracing::info!(environment = %env.name, image = %image, "deployed");
                    Ok(StepResult::passed(outcome.message))
                } else {
                    Ok(StepResult::failed(outcome.message))
                }
            }
            StepKind::SmokeTest => {
                let env = Self::step_environment(plan, stage)?;
                let Some((cluster, _)) = clusters.get(&env.name) else {
                    return Ok(StepResult::failed(format!(
                        "nothing deployed to '{}' in this run",
                        env.name
                    )));
                };

                if c.smoke_tester
                    .probe(invocation, cluster, &env.endpoints)
                    .await?
                {
                    Ok(StepResult::passed(format!(
                        "{} endpoint(s) healthy",
                        env.endpoints.len()
                    )))
                } else {
                    Ok(StepResult::failed("smoke test reported unhealthy endpoints"))
                }
            }
        }
    }

    fn scan_result(
        step: &Step,
        report: &ScanReport,
    ) -> Result<StepResult, DeployflowError> {
        let content = serde_json::to_string(report)?;
        let result = if report.blocks_at(step.fail_threshold()) {
            StepResult::failed(format!(
                "{} at or above {}",
                report.summary(),
                step.fail_threshold()
            ))
        } else {
            StepResult::passed(report.summary())
        };
        Ok(result.with_artifact(ArtifactValue::Report(content)))
    }

    fn read_image<'a>(
        stage: &Stage,
        step: &Step,
        artifacts: &'a ArtifactStore,
    ) -> Result<&'a ImageRef, DeployflowError> {
        let name = step.reads.first().map(String::as_str).unwrap_or_default();
        artifacts
            .image(name)
            .ok_or_else(|| DeployflowError::missing_artifact(&stage.name, name, None))
    }

    fn step_environment<'a>(
        plan: &'a RunPlan,
        stage: &Stage,
    ) -> Result<&'a Environment, DeployflowError> {
        let name = stage
            .environment
            .as_deref()
            .ok_or_else(|| DeployflowError::InvalidStage {
                stage: stage.name.clone(),
                reason: "deploy and smoke test steps need an environment".into(),
            })?;
        plan.environments.require(name)
    }

    /// Tear down every cluster provisioned by the run
    async fn teardown(&self, clusters: Clusters) {
        for (environment, (cluster, invocation)) in clusters {
            match self
                .collaborators
                .provisioner
                .teardown(&invocation, &cluster)
                .await
            {
                Ok(()) => tracing::debug!(environment = %environment, cluster = %cluster.id, "cluster torn down"),
                Err(e) => tracing::warn!(
                    environment = %environment,
                    cluster = %cluster.id,
                    error = %e,
                    "cluster teardown failed"
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::FakeCollaborators;
    use crate::gate::{GateDecision, PresetApprover, CANCELLED_REASON};
    use crate::pipeline::{cancellation, Pipeline, RunRequest, Severity};
    use crate::state::MemoryStore;

    const WEB_APP: &str = r#"
name: web-app
environments:
  - name: staging
    promotion_branch: develop
    replicas: 2
  - name: production
    promotion_branch: main
    requires_gate: true
    replicas: 3
stages:
  - name: build
    steps:
      - kind: build
        collaborator: make
      - kind: lint
        collaborator: flake8
      - kind: test
        collaborator: pytest
        produces: coverage
  - name: scan
    steps:
      - kind: security_scan_code
        collaborator: bandit
        policy: advisory
  - name: image
    depends_on: [build, scan]
    steps:
      - kind: build_image
        collaborator: docker
        produces: image
      - kind: scan_image
        collaborator: trivy
        policy: blocking
        fail_on: critical
        reads: [image]
  - name: deploy-staging
    depends_on: [image]
    environment: staging
    steps:
      - kind: deploy
        collaborator: kubectl
        reads: [image]
      - kind: smoke_test
        collaborator: curl
  - name: deploy-production
    depends_on: [image]
    environment: production
    steps:
      - kind: deploy
        collaborator: kubectl
        reads: [image]
      - kind: smoke_test
        collaborator: curl
"#;

    fn pipeline() -> Pipeline {
        Pipeline::from_yaml(WEB_APP).unwrap()
    }

    fn executor(fake: &Arc<FakeCollaborators>, store: &Arc<MemoryStore>) -> PipelineExecutor {
        PipelineExecutor::new(Collaborators::uniform(fake.clone()), store.clone())
    }

    async fn run_on(
        fake: FakeCollaborators,
        approver: Option<PresetApprover>,
        branch: &str,
    ) -> (PipelineRun, Arc<FakeCollaborators>, Arc<MemoryStore>) {
        let fake = Arc::new(fake);
        let store = Arc::new(MemoryStore::new());
        let mut executor = executor(&fake, &store);
        if let Some(approver) = approver {
            executor = executor.with_approver(Arc::new(approver));
        }

        let plan = RunPlan::build(&pipeline(), RunRequest::new("c1", branch)).unwrap();
        let run = executor.execute(&plan, CancelSignal::never()).await.unwrap();
        (run, fake, store)
    }

    fn outcome<'a>(run: &'a PipelineRun, stage: &str) -> &'a StageOutcome {
        &run.stage(stage).unwrap().outcome
    }

    #[tokio::test]
    async fn test_develop_deploys_staging_automatically() {
        let (run, fake, store) = run_on(FakeCollaborators::new(), None, "develop").await;

        assert_eq!(run.overall_outcome, Some(RunOutcome::Succeeded));
        assert_eq!(outcome(&run, "deploy-staging"), &StageOutcome::Succeeded);
        assert_eq!(
            outcome(&run, "deploy-production"),
            &StageOutcome::Skipped(SkipReason::BranchMismatch)
        );
        assert!(run.gates.is_empty());
        assert_eq!(fake.deployed(), vec![("staging".into(), "app:c1".into())]);
        assert_eq!(fake.teardowns(), 1);

        let known_good = store.known_good("staging").await.unwrap().unwrap();
        assert_eq!(known_good.commit, "c1");
        assert_eq!(known_good.run_id, run.id);
        assert!(run.promotions_applied);
        assert!(store.load_run(&run.id).await.unwrap().unwrap().promotions_applied);
    }

    #[tokio::test]
    async fn test_rejected_gate_skips_production() {
        let approver = PresetApprover::reject("alice", "smoke test concerns");
        let (run, fake, store) = run_on(FakeCollaborators::new(), Some(approver), "main").await;

        assert_eq!(run.overall_outcome, Some(RunOutcome::Failed));
        assert_eq!(
            outcome(&run, "deploy-production"),
            &StageOutcome::Skipped(SkipReason::GateNotApproved {
                environment: "production".into(),
                state: GateState::Rejected,
            })
        );

        let gate = run.gate_for("production").unwrap();
        assert_eq!(gate.reason.as_deref(), Some("smoke test concerns"));
        assert_eq!(gate.decided_by.as_deref(), Some("alice"));
        assert!(fake.deployed().is_empty());
        assert!(store.known_good("production").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_approved_gate_promotes_production() {
        let approver = PresetApprover::approve("alice");
        let (run, fake, store) = run_on(FakeCollaborators::new(), Some(approver), "main").await;

        assert_eq!(run.overall_outcome, Some(RunOutcome::Succeeded));
        assert_eq!(fake.deployed(), vec![("production".into(), "app:c1".into())]);
        assert_eq!(
            store.known_good("production").await.unwrap().unwrap().commit,
            "c1"
        );
    }

    #[tokio::test]
    async fn test_feature_branch_never_deploys() {
        let (run, fake, store) = run_on(FakeCollaborators::new(), None, "feature/login").await;

        assert_eq!(run.overall_outcome, Some(RunOutcome::Succeeded));
        assert!(run.promotions.is_empty());
        assert!(fake.deployed().is_empty());
        assert!(store.all_known_good().await.unwrap().is_empty());
        assert_eq!(
            run.artifacts.image("image"),
            Some(&ImageRef("app:c1".into()))
        );
    }

    #[tokio::test]
    async fn test_build_failure_skips_dependents_only() {
        let fake = FakeCollaborators::new().failing(StepKind::Build);
        let (run, fake, store) = run_on(fake, None, "develop").await;

        assert_eq!(run.overall_outcome, Some(RunOutcome::Failed));
        assert_eq!(outcome(&run, "build"), &StageOutcome::Failed);
        // Lint and test never ran
        let build = run.stage("build").unwrap();
        assert_eq!(build.steps[1].outcome, StepOutcome::Skipped);
        assert_eq!(build.steps[2].outcome, StepOutcome::Skipped);
        // The independent scan stage still ran
        assert_eq!(outcome(&run, "scan"), &StageOutcome::Succeeded);
        assert_eq!(
            outcome(&run, "image"),
            &StageOutcome::Skipped(SkipReason::UpstreamFailed {
                stage: "build".into()
            })
        );
        // Skips propagate with their original reason
        assert_eq!(
            outcome(&run, "deploy-staging"),
            &StageOutcome::Skipped(SkipReason::UpstreamFailed {
                stage: "build".into()
            })
        );
        assert!(!fake.log().iter().any(|l| l == "build:lint"));
        assert!(store.known_good("staging").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_advisory_scan_failure_continues() {
        // High findings fail the advisory code scan but stay under the
        // critical threshold of the image scan
        let fake = FakeCollaborators::new().with_scan_severity(Severity::High);
        let (run, _, _) = run_on(fake, None, "develop").await;

        assert_eq!(run.overall_outcome, Some(RunOutcome::Succeeded));
        let scan = &run.stage("scan").unwrap().steps[0];
        assert!(scan.advisory);
        assert!(scan.outcome.is_failed());
        assert_eq!(outcome(&run, "scan"), &StageOutcome::Succeeded);
    }

    #[tokio::test]
    async fn test_blocking_scan_failure_stops_deploy() {
        let fake = FakeCollaborators::new().with_scan_severity(Severity::Critical);
        let (run, fake, _) = run_on(fake, None, "develop").await;

        assert_eq!(run.overall_outcome, Some(RunOutcome::Failed));
        assert_eq!(outcome(&run, "image"), &StageOutcome::Failed);
        assert!(matches!(
            outcome(&run, "deploy-staging"),
            StageOutcome::Skipped(SkipReason::UpstreamFailed { .. })
        ));
        assert!(fake.deployed().is_empty());
    }

    #[tokio::test]
    async fn test_collaborator_error_is_step_failure() {
        let fake = FakeCollaborators::new().erroring(StepKind::Deploy);
        let (run, _, store) = run_on(fake, None, "develop").await;

        assert_eq!(run.overall_outcome, Some(RunOutcome::Failed));
        let deploy = &run.stage("deploy-staging").unwrap().steps[0];
        assert!(deploy
            .outcome
            .message()
            .is_some_and(|m| m.contains("connection refused")));
        assert!(deploy.outcome.is_failed());
        assert!(store.known_good("staging").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_failed_smoke_test_keeps_known_good() {
        let fake = FakeCollaborators::new().failing(StepKind::SmokeTest);
        let (run, fake, store) = run_on(fake, None, "develop").await;

        assert_eq!(run.overall_outcome, Some(RunOutcome::Failed));
        assert_eq!(fake.deployed().len(), 1);
        assert!(store.known_good("staging").await.unwrap().is_none());
    }

    #[test]
    fn test_cycle_invokes_no_collaborator() {
        let fake = Arc::new(FakeCollaborators::new());
        let mut pipeline = pipeline();
        pipeline.stages[0].depends_on = vec!["deploy-staging".into()];

        let err = RunPlan::build(&pipeline, RunRequest::new("c1", "develop")).unwrap_err();
        assert!(matches!(err, DeployflowError::CircularDependency { .. }));
        assert_eq!(fake.calls(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_runs_serialize_deploys() {
        let fake = Arc::new(
            FakeCollaborators::new().with_deploy_delay(Duration::from_millis(50)),
        );
        let store = Arc::new(MemoryStore::new());
        let executor = executor(&fake, &store);

        let first = RunPlan::build(&pipeline(), RunRequest::new("c1", "develop")).unwrap();
        let second = RunPlan::build(&pipeline(), RunRequest::new("c2", "develop")).unwrap();

        let (a, b) = tokio::join!(
            executor.execute(&first, CancelSignal::never()),
            executor.execute(&second, CancelSignal::never()),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(a.overall_outcome, Some(RunOutcome::Succeeded));
        assert_eq!(b.overall_outcome, Some(RunOutcome::Succeeded));
        assert_eq!(fake.max_concurrent_deploys(), 1);
        assert_eq!(fake.deployed().len(), 2);

        // The run that finished last holds the known-good commit
        let last = if a.finished_at >= b.finished_at { &a } else { &b };
        assert_eq!(
            store.known_good("staging").await.unwrap().unwrap().commit,
            last.commit_sha
        );
    }

    #[tokio::test]
    async fn test_cancel_during_gate_wait() {
        let fake = Arc::new(FakeCollaborators::new());
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(executor(&fake, &store));
        let (canceller, signal) = cancellation();

        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move {
                let plan = RunPlan::build(&pipeline(), RunRequest::new("c1", "main")).unwrap();
                executor.execute(&plan, signal).await
            })
        };

        while executor.gates().open_gates().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        canceller.cancel();

        let run = handle.await.unwrap().unwrap();
        assert!(run.cancelled);
        assert_eq!(run.overall_outcome, Some(RunOutcome::Cancelled));
        assert_eq!(
            outcome(&run, "deploy-production"),
            &StageOutcome::Skipped(SkipReason::Cancelled)
        );

        let gate = run.gate_for("production").unwrap();
        assert_eq!(gate.state, GateState::Rejected);
        assert_eq!(gate.reason.as_deref(), Some(CANCELLED_REASON));
        assert!(fake.deployed().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_step_lets_it_finish() {
        let fake = Arc::new(
            FakeCollaborators::new().with_step_delay(StepKind::Build, Duration::from_millis(100)),
        );
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(executor(&fake, &store));
        let (canceller, signal) = cancellation();

        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move {
                let plan = RunPlan::build(&pipeline(), RunRequest::new("c1", "develop")).unwrap();
                executor.execute(&plan, signal).await
            })
        };

        // The build step is in flight once the fake has seen its call
        while fake.calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        canceller.cancel();

        let run = handle.await.unwrap().unwrap();
        assert!(run.cancelled);
        assert_eq!(run.overall_outcome, Some(RunOutcome::Cancelled));

        let build = run.stage("build").unwrap();
        assert!(build.steps[0].outcome.is_succeeded());
        assert_eq!(build.steps[1].outcome, StepOutcome::Skipped);
        assert_eq!(build.steps[2].outcome, StepOutcome::Skipped);
        assert_eq!(build.outcome, StageOutcome::Skipped(SkipReason::Cancelled));

        for stage in ["scan", "image", "deploy-staging"] {
            assert_eq!(
                outcome(&run, stage),
                &StageOutcome::Skipped(SkipReason::Cancelled),
                "stage {stage}"
            );
        }
        assert_eq!(fake.log(), vec!["build:build"]);
        assert!(store.known_good("staging").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_declared_reads_reach_collaborators() {
        let fake = Arc::new(FakeCollaborators::new());
        let store = Arc::new(MemoryStore::new());
        let executor = executor(&fake, &store);

        let mut pipeline = pipeline();
        pipeline.stages[2].steps[0].reads = vec!["coverage".into()];
        let plan = RunPlan::build(&pipeline, RunRequest::new("c1", "develop")).unwrap();
        let run = executor.execute(&plan, CancelSignal::never()).await.unwrap();
        assert_eq!(run.overall_outcome, Some(RunOutcome::Succeeded));

        let image_inputs = fake.inputs("image:build_image").unwrap();
        assert_eq!(
            image_inputs.get("coverage"),
            Some(&ArtifactValue::Report("test report".into()))
        );

        let deploy_inputs = fake.inputs("deploy-staging:deploy").unwrap();
        assert_eq!(
            deploy_inputs.get("image"),
            Some(&ArtifactValue::Image(ImageRef("app:c1".into())))
        );
        // Nothing undeclared leaks through
        assert!(fake.inputs("build:lint").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_external_decision_releases_gate() {
        let fake = Arc::new(FakeCollaborators::new());
        let store = Arc::new(MemoryStore::new());
        let executor = Arc::new(executor(&fake, &store));

        let handle = {
            let executor = executor.clone();
            tokio::spawn(async move {
                let plan = RunPlan::build(&pipeline(), RunRequest::new("c1", "main")).unwrap();
                executor.execute(&plan, CancelSignal::never()).await
            })
        };

        let gate = loop {
            if let Some(gate) = executor.gates().open_gates().await.into_iter().next() {
                break gate;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        // Nothing deploys while the gate is open
        assert!(fake.deployed().is_empty());

        executor
            .gates()
            .decide(&gate.id, GateDecision::Approve { by: "bob".into() })
            .await
            .unwrap();

        let run = handle.await.unwrap().unwrap();
        assert_eq!(run.overall_outcome, Some(RunOutcome::Succeeded));
        assert_eq!(fake.deployed().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_expiry_fails_run() {
        let fake = Arc::new(FakeCollaborators::new());
        let store = Arc::new(MemoryStore::new());
        let executor = executor(&fake, &store);

        let mut pipeline = pipeline();
        pipeline.gate.timeout_secs = 60;
        let plan = RunPlan::build(&pipeline, RunRequest::new("c1", "main")).unwrap();
        let run = executor.execute(&plan, CancelSignal::never()).await.unwrap();

        assert_eq!(run.overall_outcome, Some(RunOutcome::Failed));
        assert_eq!(
            outcome(&run, "deploy-production"),
            &StageOutcome::Skipped(SkipReason::GateNotApproved {
                environment: "production".into(),
                state: GateState::Expired,
            })
        );
        assert!(store.known_good("production").await.unwrap().is_none());
    }
}
