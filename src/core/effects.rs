//! Second phase of every mutating operation.
//!
//! Operations commit their authoritative state first and hand back a
//! [`Committed`] value listing the follow-up work (notifications, funnel
//! updates, job status mirroring). [`EffectRunner`] performs that work in its
//! own failure domain: each effect runs separately, failures are logged and
//! counted, and nothing is ever reported back as the operation's failure.

use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::attribution::{self, FunnelLinks, FunnelStage, FunnelSubject};
use crate::calendar::jobs::{self, JobStatus};
use crate::core::error::{CoreError, CoreResult};
use crate::core::shared::utils::DbPool;
use crate::notifications::{NotificationSender, TemplateKind, TemplateVars};

#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    Notify {
        tenant_id: String,
        customer_id: String,
        template: TemplateKind,
        variables: TemplateVars,
    },
    AdvanceFunnel {
        tenant_id: String,
        subject: FunnelSubject,
        stage: FunnelStage,
        value: Option<i64>,
        links: FunnelLinks,
    },
    MirrorJobStatus {
        tenant_id: String,
        job_id: String,
        status: JobStatus,
        at: NaiveDateTime,
    },
}

impl SideEffect {
    fn kind(&self) -> &'static str {
        match self {
            Self::Notify { .. } => "notify",
            Self::AdvanceFunnel { .. } => "advance_funnel",
            Self::MirrorJobStatus { .. } => "mirror_job_status",
        }
    }
}

/// Authoritative result plus the best-effort work it triggers.
#[derive(Debug, Clone)]
#[must_use]
pub struct Committed<T> {
    pub value: T,
    pub effects: Vec<SideEffect>,
}

impl<T> Committed<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            effects: Vec::new(),
        }
    }

    pub fn with(mut self, effect: SideEffect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_all(mut self, effects: impl IntoIterator<Item = SideEffect>) -> Self {
        self.effects.extend(effects);
        self
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Committed<U> {
        Committed {
            value: f(self.value),
            effects: self.effects,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EffectReport {
    pub attempted: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct EffectRunner {
    pool: DbPool,
    notifier: Arc<dyn NotificationSender>,
}

impl EffectRunner {
    pub fn new(pool: DbPool, notifier: Arc<dyn NotificationSender>) -> Self {
        Self { pool, notifier }
    }

    /// Run the effects and return the committed value.
    pub async fn complete<T>(&self, committed: Committed<T>) -> T {
        let Committed { value, effects } = committed;
        if effects.is_empty() {
            return value;
        }
        let report = self.run(effects).await;
        if report.failed > 0 {
            tracing::warn!(attempted = report.attempted, failed = report.failed, "Side effects partially failed");
        } else {
            tracing::debug!(attempted = report.attempted, "Side effects completed");
        }
        value
    }

    pub async fn run(&self, effects: Vec<SideEffect>) -> EffectReport {
        let mut report = EffectReport::default();
        for effect in effects {
            report.attempted += 1;
            let kind = effect.kind();
            if let Err(e) = self.apply(effect).await {
                report.failed += 1;
                tracing::warn!(effect = kind, error = %e, "Best-effort side effect failed");
            }
        }
        report
    }

    async fn apply(&self, effect: SideEffect) -> CoreResult<()> {
        match effect {
            SideEffect::Notify {
                tenant_id,
                customer_id,
                template,
                variables,
            } => {
                let outcome = self
                    .notifier
                    .send(&tenant_id, &customer_id, template, &variables)
                    .await;
                if outcome.success {
                    Ok(())
                } else {
                    Err(CoreError::External(format!(
                        "notification {template} to customer {customer_id}: {}",
                        outcome.error.as_deref().unwrap_or("not delivered")
                    )))
                }
            }
            SideEffect::AdvanceFunnel {
                tenant_id,
                subject,
                stage,
                value,
                links,
            } => {
                let pool = self.pool.clone();
                tokio::task::spawn_blocking(move || {
                    let mut conn = pool.get()?;
                    attribution::advance_stage(&mut conn, &tenant_id, &subject, stage, value, &links)
                        .map(|_| ())
                })
                .await?
            }
            SideEffect::MirrorJobStatus {
                tenant_id,
                job_id,
                status,
                at,
            } => {
                let pool = self.pool.clone();
                tokio::task::spawn_blocking(move || {
                    let mut conn = pool.get()?;
                    jobs::mirror_job_status(&mut conn, &tenant_id, &job_id, status, at).map(|_| ())
                })
                .await?
            }
        }
    }
}
