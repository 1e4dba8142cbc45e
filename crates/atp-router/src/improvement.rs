//! Continuous-improvement pipeline.
//!
//! A staged DAG with seven steps in fixed order: quality check, drift
//! detection, active learning, retraining trigger, model evaluation,
//! promotion decision, deployment. Steps run strictly sequentially; each
//! reads its predecessors' result maps, and a failed step fails the whole
//! execution. Deployment is skipped when no model is promoted.

use crate::error::Result;
use atp_observability::metric_names::{
    METRIC_CI_EXECUTIONS_TOTAL, METRIC_CI_STEP_DURATION_SECONDS,
};
use atp_observability::metrics;
use atp_registry::ModelRegistry;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use prometheus::{HistogramOpts, Opts};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};
use uuid::Uuid;

/// Quality-score advantage a shadow model needs over the family's active
/// model to be promoted.
const PROMOTION_THRESHOLD: f64 = 0.05;

/// Absolute quality gap between a family's active and shadow models that
/// counts as drift.
const DRIFT_THRESHOLD: f64 = 0.1;

/// The seven stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    QualityCheck,
    DriftDetection,
    ActiveLearning,
    RetrainingTrigger,
    ModelEvaluation,
    PromotionDecision,
    Deployment,
}

impl PipelineStage {
    /// All stages in execution order.
    #[must_use]
    pub fn ordered() -> [PipelineStage; 7] {
        [
            PipelineStage::QualityCheck,
            PipelineStage::DriftDetection,
            PipelineStage::ActiveLearning,
            PipelineStage::RetrainingTrigger,
            PipelineStage::ModelEvaluation,
            PipelineStage::PromotionDecision,
            PipelineStage::Deployment,
        ]
    }
}

impl std::fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineStage::QualityCheck => "quality_check",
            PipelineStage::DriftDetection => "drift_detection",
            PipelineStage::ActiveLearning => "active_learning",
            PipelineStage::RetrainingTrigger => "retraining_trigger",
            PipelineStage::ModelEvaluation => "model_evaluation",
            PipelineStage::PromotionDecision => "promotion_decision",
            PipelineStage::Deployment => "deployment",
        };
        f.write_str(s)
    }
}

/// Status of a step or of the whole execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

/// One step of an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineStep {
    pub stage: PipelineStage,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub result: HashMap<String, Value>,
    pub error: Option<String>,
}

impl PipelineStep {
    fn new(stage: PipelineStage) -> Self {
        Self {
            stage,
            status: StepStatus::Pending,
            started_at: None,
            ended_at: None,
            result: HashMap::new(),
            error: None,
        }
    }
}

/// One end-to-end execution of the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub execution_id: String,
    pub trigger_reason: String,
    pub status: StepStatus,
    pub steps: Vec<PipelineStep>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineExecution {
    /// The step for a stage.
    #[must_use]
    pub fn step(&self, stage: PipelineStage) -> Option<&PipelineStep> {
        self.steps.iter().find(|s| s.stage == stage)
    }

    fn step_mut(&mut self, stage: PipelineStage) -> Option<&mut PipelineStep> {
        self.steps.iter_mut().find(|s| s.stage == stage)
    }
}

/// Execution counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStatistics {
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
}

/// Drives quality-gated promotion of shadow models.
pub struct ContinuousImprovementPipeline {
    registry: Arc<ModelRegistry>,
    statistics: Mutex<PipelineStatistics>,
    executions: Mutex<Vec<PipelineExecution>>,
    executions_total: prometheus::CounterVec,
    step_duration: prometheus::Histogram,
}

impl std::fmt::Debug for ContinuousImprovementPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContinuousImprovementPipeline")
            .finish_non_exhaustive()
    }
}

impl ContinuousImprovementPipeline {
    /// Create a pipeline over the registry it governs.
    #[must_use]
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self {
            registry,
            statistics: Mutex::new(PipelineStatistics::default()),
            executions: Mutex::new(Vec::new()),
            executions_total: metrics::counter_vec(
                Opts::new(
                    METRIC_CI_EXECUTIONS_TOTAL,
                    "Total continuous-improvement executions",
                ),
                &["outcome"],
            ),
            step_duration: metrics::histogram(
                HistogramOpts::new(
                    METRIC_CI_STEP_DURATION_SECONDS,
                    "Continuous-improvement step duration",
                )
                .buckets(vec![1.0, 5.0, 10.0, 30.0, 60.0, 300.0]),
            ),
        }
    }

    /// Run one pipeline execution.
    ///
    /// # Errors
    ///
    /// Registry failures inside a step mark that step (and the execution)
    /// failed rather than erroring out of this call; only lock poisoning
    /// style internal faults would surface here.
    pub async fn execute(&self, trigger_reason: &str) -> Result<PipelineExecution> {
        let mut execution = PipelineExecution {
            execution_id: format!("ci_{}", &Uuid::new_v4().simple().to_string()[..8]),
            trigger_reason: trigger_reason.to_string(),
            status: StepStatus::Running,
            steps: PipelineStage::ordered().map(PipelineStep::new).to_vec(),
            started_at: Utc::now(),
            completed_at: None,
        };
        info!(
            execution = execution.execution_id,
            trigger = trigger_reason,
            "continuous-improvement pipeline started"
        );

        for stage in PipelineStage::ordered() {
            let outcome = self.run_step(&mut execution, stage);
            if outcome == StepStatus::Failed {
                execution.status = StepStatus::Failed;
                break;
            }
        }
        if execution.status == StepStatus::Running {
            execution.status = StepStatus::Success;
        }
        execution.completed_at = Some(Utc::now());

        let outcome_label = if execution.status == StepStatus::Success {
            "success"
        } else {
            "failed"
        };
        self.executions_total
            .with_label_values(&[outcome_label])
            .inc();
        {
            let mut statistics = self.statistics.lock();
            statistics.total_executions += 1;
            if execution.status == StepStatus::Success {
                statistics.successful_executions += 1;
            } else {
                statistics.failed_executions += 1;
            }
        }
        self.executions.lock().push(execution.clone());
        Ok(execution)
    }

    fn run_step(&self, execution: &mut PipelineExecution, stage: PipelineStage) -> StepStatus {
        let started = Instant::now();
        if let Some(step) = execution.step_mut(stage) {
            step.status = StepStatus::Running;
            step.started_at = Some(Utc::now());
        }

        let outcome = match stage {
            PipelineStage::QualityCheck => self.quality_check(),
            PipelineStage::DriftDetection => self.drift_detection(),
            PipelineStage::ActiveLearning => Ok(Self::active_learning(execution)),
            PipelineStage::RetrainingTrigger => Ok(Self::retraining_trigger(execution)),
            PipelineStage::ModelEvaluation => self.model_evaluation(),
            PipelineStage::PromotionDecision => Ok(Self::promotion_decision(execution)),
            PipelineStage::Deployment => self.deployment(execution),
        };

        let status = if let Some(step) = execution.step_mut(stage) {
            match outcome {
                Ok(Some(result)) => {
                    step.result = result;
                    step.status = StepStatus::Success;
                }
                Ok(None) => {
                    step.status = StepStatus::Skipped;
                }
                Err(error) => {
                    warn!(stage = %stage, error, "pipeline step failed");
                    step.error = Some(error);
                    step.status = StepStatus::Failed;
                }
            }
            step.ended_at = Some(Utc::now());
            step.status
        } else {
            StepStatus::Failed
        };

        self.step_duration.observe(started.elapsed().as_secs_f64());
        status
    }

    #[allow(clippy::unnecessary_wraps)]
    fn quality_check(&self) -> StepOutcome {
        let models = self.registry.get_enabled_models();
        let observations = models.len();
        let avg_quality = if observations == 0 {
            0.0
        } else {
            models.iter().map(|m| m.quality_score).sum::<f64>() / observations as f64
        };
        let mut result = HashMap::new();
        result.insert("avg_quality_score".to_string(), Value::from(avg_quality));
        result.insert("total_observations".to_string(), Value::from(observations));
        Ok(Some(result))
    }

    #[allow(clippy::unnecessary_wraps)]
    fn drift_detection(&self) -> StepOutcome {
        let gaps = self.family_quality_gaps();
        let drift_models: Vec<String> = gaps
            .iter()
            .filter(|(_, gap)| gap.abs() > DRIFT_THRESHOLD)
            .map(|(family, _)| family.clone())
            .collect();
        let max_gap = gaps
            .values()
            .fold(0.0_f64, |acc, gap| acc.max(gap.abs()));

        let mut result = HashMap::new();
        result.insert(
            "drift_detected".to_string(),
            Value::from(!drift_models.is_empty()),
        );
        result.insert("drift_models".to_string(), Value::from(drift_models));
        result.insert("max_quality_gap".to_string(), Value::from(max_gap));
        Ok(Some(result))
    }

    fn active_learning(execution: &PipelineExecution) -> Option<HashMap<String, Value>> {
        let drift_detected = execution
            .step(PipelineStage::DriftDetection)
            .and_then(|s| s.result.get("drift_detected"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        // Drifting families produce labeling tasks; a quiet system is
        // considered saturated.
        let tasks = if drift_detected { 25 } else { 0 };
        let mut result = HashMap::new();
        result.insert("labeling_tasks".to_string(), Value::from(tasks));
        result.insert("saturated".to_string(), Value::from(tasks == 0));
        Some(result)
    }

    fn retraining_trigger(execution: &PipelineExecution) -> Option<HashMap<String, Value>> {
        let drift_detected = execution
            .step(PipelineStage::DriftDetection)
            .and_then(|s| s.result.get("drift_detected"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let saturated = execution
            .step(PipelineStage::ActiveLearning)
            .and_then(|s| s.result.get("saturated"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        let mut result = HashMap::new();
        result.insert(
            "retraining_triggered".to_string(),
            Value::from(drift_detected || !saturated),
        );
        Some(result)
    }

    #[allow(clippy::unnecessary_wraps)]
    fn model_evaluation(&self) -> StepOutcome {
        // Best shadow candidate per family, by quality advantage over the
        // family's active model.
        let mut best: Option<(String, f64)> = None;
        for shadow in self.registry.get_shadow_models() {
            let baseline = self.active_family_quality(&shadow.family);
            let improvement = shadow.quality_score - baseline;
            if best.as_ref().map_or(true, |(_, b)| improvement > *b) {
                best = Some((shadow.name.clone(), improvement));
            }
        }

        let mut result = HashMap::new();
        match best {
            Some((candidate, improvement)) => {
                result.insert("candidate".to_string(), Value::from(candidate));
                result.insert(
                    "improvement_over_baseline".to_string(),
                    Value::from(improvement),
                );
            }
            None => {
                result.insert("candidate".to_string(), Value::Null);
                result.insert("improvement_over_baseline".to_string(), Value::from(0.0));
            }
        }
        Ok(Some(result))
    }

    fn promotion_decision(execution: &PipelineExecution) -> Option<HashMap<String, Value>> {
        let evaluation = execution.step(PipelineStage::ModelEvaluation)?;
        let candidate = evaluation.result.get("candidate").cloned();
        let improvement = evaluation
            .result
            .get("improvement_over_baseline")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);

        let promote =
            improvement > PROMOTION_THRESHOLD && candidate.as_ref().is_some_and(|c| !c.is_null());
        let mut result = HashMap::new();
        result.insert("promote".to_string(), Value::from(promote));
        result.insert(
            "candidate".to_string(),
            candidate.unwrap_or(Value::Null),
        );
        result.insert("improvement".to_string(), Value::from(improvement));
        Some(result)
    }

    fn deployment(&self, execution: &PipelineExecution) -> StepOutcome {
        let decision = execution
            .step(PipelineStage::PromotionDecision)
            .map(|s| s.result.clone())
            .unwrap_or_default();
        let promote = decision
            .get("promote")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !promote {
            // Nothing to deploy.
            return Ok(None);
        }
        let Some(candidate) = decision.get("candidate").and_then(Value::as_str) else {
            return Err("promotion decision carried no candidate".to_string());
        };

        let family = self
            .registry
            .get_model(candidate)
            .map_err(|e| e.to_string())?
            .family;
        let previous_active: Vec<String> = self
            .registry
            .get_enabled_models()
            .into_iter()
            .filter(|m| m.family == family)
            .map(|m| m.name)
            .collect();

        self.registry
            .promote_shadow(candidate)
            .map_err(|e| e.to_string())?;
        // Demote the family's previous active model(s) to shadow.
        for name in &previous_active {
            if let Err(e) = self.registry.demote_to_shadow(name) {
                warn!(model = name, error = %e, "failed to demote previous active model");
            }
        }

        info!(model = candidate, "deployed promoted model");
        let mut result = HashMap::new();
        result.insert("deployed".to_string(), Value::from(candidate));
        result.insert("demoted".to_string(), Value::from(previous_active));
        Ok(Some(result))
    }

    fn family_quality_gaps(&self) -> HashMap<String, f64> {
        let mut gaps = HashMap::new();
        for shadow in self.registry.get_shadow_models() {
            let baseline = self.active_family_quality(&shadow.family);
            gaps.insert(shadow.family.clone(), shadow.quality_score - baseline);
        }
        gaps
    }

    fn active_family_quality(&self, family: &str) -> f64 {
        self.registry
            .get_enabled_models()
            .into_iter()
            .filter(|m| m.family == family)
            .map(|m| m.quality_score)
            .fold(f64::NAN, f64::max)
            .max(0.0)
    }

    /// Execution counters.
    #[must_use]
    pub fn statistics(&self) -> PipelineStatistics {
        self.statistics.lock().clone()
    }

    /// All recorded executions, oldest first.
    #[must_use]
    pub fn executions(&self) -> Vec<PipelineExecution> {
        self.executions.lock().clone()
    }
}

/// `Ok(Some)` success with results, `Ok(None)` skipped, `Err` failed.
type StepOutcome = std::result::Result<Option<HashMap<String, Value>>, String>;

#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use atp_registry::{ModelEntry, ModelStatus, ProviderEntry, ProviderHealth, ProviderType};

    fn registry_with(shadow_quality: f64, active_quality: f64) -> Arc<ModelRegistry> {
        let registry = Arc::new(ModelRegistry::new());
        registry
            .create_provider(
                ProviderEntry::new("prov", ProviderType::Cloud)
                    .with_health(ProviderHealth::Healthy),
            )
            .unwrap();
        registry
            .create_model(
                ModelEntry::new("active-model", "prov", "fam")
                    .with_quality_score(active_quality),
            )
            .unwrap();
        registry
            .create_model(
                ModelEntry::new("shadow-model", "prov", "fam")
                    .with_status(ModelStatus::Shadow)
                    .with_quality_score(shadow_quality),
            )
            .unwrap();
        registry
    }

    #[tokio::test]
    async fn test_promotion_path() {
        let registry = registry_with(0.95, 0.80);
        let pipeline = ContinuousImprovementPipeline::new(Arc::clone(&registry));

        let execution = pipeline.execute("scheduled").await.unwrap();
        assert_eq!(execution.status, StepStatus::Success);

        let decision = execution.step(PipelineStage::PromotionDecision).unwrap();
        assert_eq!(decision.result["promote"], Value::from(true));
        assert_eq!(decision.result["candidate"], "shadow-model");

        let deployment = execution.step(PipelineStage::Deployment).unwrap();
        assert_eq!(deployment.status, StepStatus::Success);
        assert_eq!(deployment.result["deployed"], "shadow-model");

        // The registry reflects the swap.
        assert_eq!(
            registry.get_model("shadow-model").unwrap().status,
            ModelStatus::Active
        );
        assert_eq!(
            registry.get_model("active-model").unwrap().status,
            ModelStatus::Shadow
        );
    }

    #[tokio::test]
    async fn test_no_promotion_skips_deployment() {
        let registry = registry_with(0.82, 0.80);
        let pipeline = ContinuousImprovementPipeline::new(Arc::clone(&registry));

        let execution = pipeline.execute("scheduled").await.unwrap();
        assert_eq!(execution.status, StepStatus::Success);

        let decision = execution.step(PipelineStage::PromotionDecision).unwrap();
        assert_eq!(decision.result["promote"], Value::from(false));
        assert_eq!(
            execution.step(PipelineStage::Deployment).unwrap().status,
            StepStatus::Skipped
        );
        assert_eq!(
            registry.get_model("shadow-model").unwrap().status,
            ModelStatus::Shadow
        );
    }

    #[tokio::test]
    async fn test_drift_feeds_retraining_trigger() {
        let registry = registry_with(0.95, 0.80);
        let pipeline = ContinuousImprovementPipeline::new(registry);

        let execution = pipeline.execute("scheduled").await.unwrap();
        let drift = execution.step(PipelineStage::DriftDetection).unwrap();
        assert_eq!(drift.result["drift_detected"], Value::from(true));

        let trigger = execution.step(PipelineStage::RetrainingTrigger).unwrap();
        assert_eq!(trigger.result["retraining_triggered"], Value::from(true));
    }

    #[tokio::test]
    async fn test_steps_run_in_fixed_order() {
        let registry = registry_with(0.5, 0.5);
        let pipeline = ContinuousImprovementPipeline::new(registry);
        let execution = pipeline.execute("scheduled").await.unwrap();

        let stages: Vec<PipelineStage> = execution.steps.iter().map(|s| s.stage).collect();
        assert_eq!(stages, PipelineStage::ordered().to_vec());

        for window in execution.steps.windows(2) {
            if let (Some(a), Some(b)) = (window[0].ended_at, window[1].started_at) {
                assert!(a <= b, "steps overlapped");
            }
        }
    }

    #[tokio::test]
    async fn test_statistics_count_executions() {
        let registry = registry_with(0.9, 0.8);
        let pipeline = ContinuousImprovementPipeline::new(registry);
        pipeline.execute("a").await.unwrap();
        pipeline.execute("b").await.unwrap();

        let statistics = pipeline.statistics();
        assert_eq!(statistics.total_executions, 2);
        assert_eq!(statistics.successful_executions, 2);
        assert_eq!(pipeline.executions().len(), 2);
    }
}
