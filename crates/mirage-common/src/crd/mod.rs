//! Custom Resource Definitions for the mirage operator

mod condition;
mod mirror;
mod rule;

pub use condition::{find_condition, is_condition_true, upsert_condition, Condition, ConditionStatus};
pub use mirror::{
    ImageStatus, Mirror, MirrorImage, MirrorSpec, MirrorStatus, CONDITION_JOB_COMPLETE,
    CONDITION_JOB_CREATED, CONDITION_JOB_FAILED, DEFAULT_ACTIVE_DEADLINE_SECONDS,
    DEFAULT_PARALLELISM, IMAGE_PHASE_PENDING,
};
pub use rule::{
    FailurePolicy, MutatingWebhookOverrides, RewriteRule, Rule, RulePhase, RuleSpec, RuleStatus,
    SideEffects,
};
