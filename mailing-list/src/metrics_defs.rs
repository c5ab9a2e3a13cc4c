//! Metrics definitions for mailing list synchronization.

use shared::metrics_defs::{MetricDef, MetricType};

pub const MAILGUN_REQUESTS: MetricDef = MetricDef {
    name: "mailgun.requests",
    metric_type: MetricType::Counter,
    description: "Requests sent to the list provider, tagged by operation and status",
};

pub const LISTS_CREATED: MetricDef = MetricDef {
    name: "lists.created",
    metric_type: MetricType::Counter,
    description: "Mailing lists created on the provider",
};

pub const LISTS_DELETED: MetricDef = MetricDef {
    name: "lists.deleted",
    metric_type: MetricType::Counter,
    description: "Mailing lists deleted from the provider",
};

pub const LISTS_RENAMED: MetricDef = MetricDef {
    name: "lists.renamed",
    metric_type: MetricType::Counter,
    description: "Mailing lists renamed after a title change",
};

pub const MEMBERS_ADDED: MetricDef = MetricDef {
    name: "members.added",
    metric_type: MetricType::Counter,
    description: "Members added to mailing lists",
};

pub const MEMBERS_REMOVED: MetricDef = MetricDef {
    name: "members.removed",
    metric_type: MetricType::Counter,
    description: "Members removed from mailing lists",
};

pub const MEMBERS_UPDATED: MetricDef = MetricDef {
    name: "members.updated",
    metric_type: MetricType::Counter,
    description: "Members updated in place",
};

pub const MESSAGES_SENT: MetricDef = MetricDef {
    name: "messages.sent",
    metric_type: MetricType::Counter,
    description: "Messages sent through the provider",
};

pub const RECONCILE_DURATION: MetricDef = MetricDef {
    name: "reconcile.duration",
    metric_type: MetricType::Histogram,
    description: "Time to reconcile one mailing list in seconds",
};

pub const TASK_RETRIES: MetricDef = MetricDef {
    name: "tasks.retries",
    metric_type: MetricType::Counter,
    description: "Tasks scheduled for another attempt after a failure",
};

pub const TASK_FAILURES: MetricDef = MetricDef {
    name: "tasks.failures",
    metric_type: MetricType::Counter,
    description: "Tasks abandoned after a permanent failure or exhausted retries",
};

pub const TASKS_IN_FLIGHT: MetricDef = MetricDef {
    name: "tasks.in_flight",
    metric_type: MetricType::Gauge,
    description: "Tasks currently executing",
};

pub const ATTACHMENTS_UPLOADED: MetricDef = MetricDef {
    name: "attachments.uploaded",
    metric_type: MetricType::Counter,
    description: "Attachments stored in the file storage service",
};

pub const ALL_METRICS: &[MetricDef] = &[
    MAILGUN_REQUESTS,
    LISTS_CREATED,
    LISTS_DELETED,
    LISTS_RENAMED,
    MEMBERS_ADDED,
    MEMBERS_REMOVED,
    MEMBERS_UPDATED,
    MESSAGES_SENT,
    RECONCILE_DURATION,
    TASK_RETRIES,
    TASK_FAILURES,
    TASKS_IN_FLIGHT,
    ATTACHMENTS_UPLOADED,
];
