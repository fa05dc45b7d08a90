//! Batch construction: groups ready tasks into small coherent units of work.
//!
//! A batch holds one to three tasks from one domain (or an allowed domain
//! pairing), fits under a time ceiling, and never mixes complexities more
//! than one severity step apart.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::task::{Complexity, TaskRecord};

/// Maximum members per complexity level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityCaps {
    pub simple: usize,
    pub medium: usize,
    pub complex: usize,
    pub critical: usize,
}

impl Default for ComplexityCaps {
    fn default() -> Self {
        Self {
            simple: 3,
            medium: 2,
            complex: 1,
            critical: 1,
        }
    }
}

impl ComplexityCaps {
    pub fn cap_for(&self, complexity: Complexity) -> usize {
        match complexity {
            Complexity::Simple => self.simple,
            Complexity::Medium => self.medium,
            Complexity::Complex => self.complex,
            Complexity::Critical => self.critical,
        }
    }
}

/// Grouping rules, loaded from the `[batch]` config table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchPolicy {
    pub max_batch_size: usize,
    pub max_batch_minutes: u64,
    /// Unordered pairs of distinct domains that may share a batch.
    pub compatible_domains: Vec<(String, String)>,
    pub size_caps: ComplexityCaps,
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            max_batch_size: 3,
            max_batch_minutes: 240,
            compatible_domains: vec![("documentation".to_string(), "testing".to_string())],
            size_caps: ComplexityCaps::default(),
        }
    }
}

impl BatchPolicy {
    /// Same domain, or an allowed pairing in either order.
    pub fn domains_compatible(&self, a: &str, b: &str) -> bool {
        a == b
            || self
                .compatible_domains
                .iter()
                .any(|(x, y)| (x == a && y == b) || (x == b && y == a))
    }

    /// Largest batch allowed for the given member complexities.
    pub fn size_limit<'a>(&self, complexities: impl IntoIterator<Item = &'a Complexity>) -> usize {
        complexities
            .into_iter()
            .map(|c| self.size_caps.cap_for(*c))
            .fold(self.max_batch_size, usize::min)
    }
}

/// Chooses the complexity label a batch declares.
pub type ComplexityPolicy = fn(&[TaskRecord]) -> Complexity;

/// Default label policy: the least severe member complexity.
// TODO: switch to the most severe member once downstream prompt sizing is
// confirmed to key off this label.
pub fn batch_complexity(tasks: &[TaskRecord]) -> Complexity {
    tasks
        .iter()
        .map(|t| t.complexity)
        .min()
        .unwrap_or_default()
}

/// A group of tasks handed to one execution actor at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskBatch {
    pub id: u32,
    pub tasks: Vec<TaskRecord>,
    /// Sum of member durations.
    pub total_minutes: u64,
    /// Most common member domain; ties go to the first seen.
    pub domain: String,
    pub complexity: Complexity,
}

impl TaskBatch {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task_ids(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.id.as_str()).collect()
    }
}

/// A rule a batch breaks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum BatchViolation {
    Empty,
    TooManyTasks { count: usize, max: usize },
    MixedDomains { domains: Vec<String> },
    OverTimeCeiling { minutes: u64, max: u64 },
    ComplexityCap { complexity: Complexity, count: usize, cap: usize },
    ComplexitySpread { lowest: Complexity, highest: Complexity },
}

impl std::fmt::Display for BatchViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BatchViolation::Empty => write!(f, "batch has no tasks"),
            BatchViolation::TooManyTasks { count, max } => {
                write!(f, "batch has {} tasks, max is {}", count, max)
            }
            BatchViolation::MixedDomains { domains } => {
                write!(f, "batch mixes incompatible domains: {}", domains.join(", "))
            }
            BatchViolation::OverTimeCeiling { minutes, max } => {
                write!(f, "batch takes {} minutes, ceiling is {}", minutes, max)
            }
            BatchViolation::ComplexityCap {
                complexity,
                count,
                cap,
            } => write!(
                f,
                "batch with {} work holds {} tasks, cap is {}",
                complexity, count, cap
            ),
            BatchViolation::ComplexitySpread { lowest, highest } => {
                write!(f, "batch spans {} to {} complexity", lowest, highest)
            }
        }
    }
}

/// Totals over a planned set of batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchPlanSummary {
    pub batch_count: usize,
    pub task_count: usize,
    pub total_minutes: u64,
    pub longest_batch_minutes: u64,
    pub average_batch_size: f64,
    pub batches_by_domain: BTreeMap<String, usize>,
}

impl std::fmt::Display for BatchPlanSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} batches, {} tasks, {} minutes total (longest {})",
            self.batch_count, self.task_count, self.total_minutes, self.longest_batch_minutes
        )
    }
}

/// Builds batches from ready tasks.
///
/// Batch ids increase monotonically per optimizer, starting at 1.
pub struct BatchOptimizer {
    policy: BatchPolicy,
    complexity_policy: ComplexityPolicy,
    next_id: u32,
}

impl BatchOptimizer {
    pub fn new(policy: BatchPolicy) -> Self {
        Self {
            policy,
            complexity_policy: batch_complexity,
            next_id: 1,
        }
    }

    /// Replace the policy that labels each batch's complexity.
    pub fn with_complexity_policy(mut self, policy: ComplexityPolicy) -> Self {
        self.complexity_policy = policy;
        self
    }

    pub fn policy(&self) -> &BatchPolicy {
        &self.policy
    }

    /// Group `tasks` into batches.
    ///
    /// Domains are grouped in first-appearance order; within a group tasks
    /// are taken most severe first and packed greedily.
    pub fn create_batches(&mut self, tasks: &[TaskRecord]) -> Vec<TaskBatch> {
        let mut batches = Vec::new();

        for (key, mut group) in self.group_by_domain(tasks) {
            group.sort_by(|a, b| b.complexity.cmp(&a.complexity));

            let mut current: Vec<TaskRecord> = Vec::new();
            for task in group {
                if !current.is_empty() && !self.fits(&current, task) {
                    let full = std::mem::take(&mut current);
                    batches.push(self.seal(full));
                }
                current.push(task.clone());
            }
            if !current.is_empty() {
                batches.push(self.seal(current));
            }
            debug!(domain = %key, "batched domain group");
        }

        batches
    }

    fn group_by_domain<'a>(&self, tasks: &'a [TaskRecord]) -> Vec<(String, Vec<&'a TaskRecord>)> {
        let mut groups: Vec<(String, Vec<&'a TaskRecord>)> = Vec::new();
        for task in tasks {
            match groups
                .iter_mut()
                .find(|(key, _)| self.policy.domains_compatible(key, &task.domain))
            {
                Some((_, members)) => members.push(task),
                None => groups.push((task.domain.clone(), vec![task])),
            }
        }
        groups
    }

    fn fits(&self, current: &[TaskRecord], incoming: &TaskRecord) -> bool {
        let limit = self.policy.size_limit(
            current
                .iter()
                .map(|t| &t.complexity)
                .chain(std::iter::once(&incoming.complexity)),
        );
        let minutes: u64 = current.iter().map(|t| u64::from(t.duration_minutes)).sum();

        current.len() < limit
            && minutes + u64::from(incoming.duration_minutes) <= self.policy.max_batch_minutes
            && current
                .iter()
                .all(|t| t.complexity.is_adjacent(incoming.complexity))
    }

    fn seal(&mut self, tasks: Vec<TaskRecord>) -> TaskBatch {
        let id = self.next_id;
        self.next_id += 1;

        let total_minutes = tasks.iter().map(|t| u64::from(t.duration_minutes)).sum();
        let domain = dominant_domain(&tasks);
        let complexity = (self.complexity_policy)(&tasks);
        debug!(batch = id, tasks = tasks.len(), total_minutes, "sealed batch");

        TaskBatch {
            id,
            tasks,
            total_minutes,
            domain,
            complexity,
        }
    }

    /// Every rule `batch` violates, in a fixed order.
    pub fn validate_batch(&self, batch: &TaskBatch) -> Vec<BatchViolation> {
        let mut violations = Vec::new();
        if batch.tasks.is_empty() {
            violations.push(BatchViolation::Empty);
            return violations;
        }

        if batch.tasks.len() > self.policy.max_batch_size {
            violations.push(BatchViolation::TooManyTasks {
                count: batch.tasks.len(),
                max: self.policy.max_batch_size,
            });
        }

        let mut domains: Vec<String> = Vec::new();
        for task in &batch.tasks {
            if !domains.contains(&task.domain) {
                domains.push(task.domain.clone());
            }
        }
        let mixed = domains.iter().enumerate().any(|(i, a)| {
            domains[i + 1..]
                .iter()
                .any(|b| !self.policy.domains_compatible(a, b))
        });
        if mixed {
            violations.push(BatchViolation::MixedDomains { domains });
        }

        let minutes: u64 = batch
            .tasks
            .iter()
            .map(|t| u64::from(t.duration_minutes))
            .sum();
        if minutes > self.policy.max_batch_minutes {
            violations.push(BatchViolation::OverTimeCeiling {
                minutes,
                max: self.policy.max_batch_minutes,
            });
        }

        // Report against the most restrictive complexity present.
        if let Some(tightest) = batch
            .tasks
            .iter()
            .map(|t| t.complexity)
            .min_by_key(|c| self.policy.size_caps.cap_for(*c))
        {
            let cap = self.policy.size_caps.cap_for(tightest);
            if batch.tasks.len() > cap {
                violations.push(BatchViolation::ComplexityCap {
                    complexity: tightest,
                    count: batch.tasks.len(),
                    cap,
                });
            }
        }

        let lowest = batch.tasks.iter().map(|t| t.complexity).min();
        let highest = batch.tasks.iter().map(|t| t.complexity).max();
        if let (Some(lowest), Some(highest)) = (lowest, highest) {
            if !lowest.is_adjacent(highest) {
                violations.push(BatchViolation::ComplexitySpread { lowest, highest });
            }
        }

        violations
    }
}

impl std::fmt::Debug for BatchOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchOptimizer")
            .field("policy", &self.policy)
            .field("next_id", &self.next_id)
            .finish()
    }
}

fn dominant_domain(tasks: &[TaskRecord]) -> String {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for task in tasks {
        match counts.iter_mut().find(|(d, _)| *d == task.domain.as_str()) {
            Some((_, n)) => *n += 1,
            None => counts.push((task.domain.as_str(), 1)),
        }
    }
    let mut best: Option<(&str, usize)> = None;
    for (domain, n) in counts {
        if best.map_or(true, |(_, top)| n > top) {
            best = Some((domain, n));
        }
    }
    best.map(|(d, _)| d.to_string()).unwrap_or_default()
}

/// Describe a batch plan for presentation.
pub fn summarize(batches: &[TaskBatch]) -> BatchPlanSummary {
    let mut summary = BatchPlanSummary {
        batch_count: batches.len(),
        ..Default::default()
    };
    for batch in batches {
        summary.task_count += batch.tasks.len();
        summary.total_minutes += batch.total_minutes;
        summary.longest_batch_minutes = summary.longest_batch_minutes.max(batch.total_minutes);
        *summary
            .batches_by_domain
            .entry(batch.domain.clone())
            .or_insert(0) += 1;
    }
    if summary.batch_count > 0 {
        summary.average_batch_size = summary.task_count as f64 / summary.batch_count as f64;
    }
    summary
}
