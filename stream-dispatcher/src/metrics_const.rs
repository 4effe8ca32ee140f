// ==== Dispatcher ====
/// Counter for dispatch cycles started (label: trigger = delay/flow)
pub const DISPATCH_TOTAL_COUNTER: &str = "dispatcher_dispatch_total";

/// Counter for dispatch cycles that were abandoned
pub const DISPATCH_FAILED_COUNTER: &str = "dispatcher_dispatch_failed_total";

/// Histogram for the duration of one dispatch cycle
pub const DISPATCH_DURATION_HISTOGRAM: &str = "dispatcher_dispatch_duration_seconds";

/// Counter for shadow records written (label: status = success/failure)
pub const SHADOW_WRITES_COUNTER: &str = "dispatcher_shadow_writes_total";

/// Counter for shadow trees deleted (label: status = success/failure)
pub const SHADOW_DELETES_COUNTER: &str = "dispatcher_shadow_deletes_total";

/// Counter for recover passes
pub const RECOVER_TOTAL_COUNTER: &str = "dispatcher_recover_total";

/// Gauge for the number of pairs in the current plan
pub const PLANNED_PAIRS_GAUGE: &str = "dispatcher_planned_pairs";

/// Gauge set to 1 while this process holds leadership
pub const LEADER_GAUGE: &str = "dispatcher_is_leader";

// ==== Auto balancer ====
/// Counter for balancing passes that produced a new grouping
pub const AUTOBALANCER_EFFECTED_COUNTER: &str = "autobalancer_effected_total";

/// Gauge for the last measured flow share fluctuation
pub const AUTOBALANCER_FLUCTUATION_GAUGE: &str = "autobalancer_fluctuation";

/// Gauge for the total difference of the chosen solution
pub const AUTOBALANCER_DIFFERENCE_GAUGE: &str = "autobalancer_different_targets";

/// Gauge for the top percent that produced the chosen solution
pub const AUTOBALANCER_BEST_TOP_PERCENT_GAUGE: &str = "autobalancer_best_top_percent";

/// Gauge for the max/min group weight ratio of the last draft
pub const AUTOBALANCER_MAX_FLOW_RATIO_GAUGE: &str = "autobalancer_max_flow_ratio";

/// Gauge for the number of balancing units in the last pass
pub const AUTOBALANCER_TARGETS_GAUGE: &str = "autobalancer_targets";

/// Gauge for the number of zero-flow units placed by hash
pub const AUTOBALANCER_ZERO_FLOW_GAUGE: &str = "autobalancer_zero_flow_targets";

// ==== Flow ====
/// Counter for stale flow records removed
pub const STALE_FLOW_DELETED_COUNTER: &str = "flow_stale_deleted_total";

// ==== Scheduler ====
/// Gauge for live work units on this worker
pub const LIVE_UNITS_GAUGE: &str = "scheduler_live_units";

/// Counter for work units restarted after an unexpected stop
pub const UNIT_RESTARTS_COUNTER: &str = "scheduler_unit_restarts_total";

/// Counter for pipeline manager operations (labels: op, status)
pub const UNIT_OPERATIONS_COUNTER: &str = "scheduler_unit_operations_total";
