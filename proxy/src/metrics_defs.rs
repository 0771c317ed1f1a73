use shared::metrics_defs::{MetricDef, MetricType};

pub const REQUEST_DURATION: MetricDef = MetricDef {
    name: "request.duration",
    metric_type: MetricType::Histogram,
    description: "Proxy request duration in seconds. Tagged with status.",
};

pub const REQUESTS_INFLIGHT: MetricDef = MetricDef {
    name: "requests.inflight",
    metric_type: MetricType::Gauge,
    description: "Number of requests currently being processed",
};

pub const RULE_RESOLVED: MetricDef = MetricDef {
    name: "rule.resolved",
    metric_type: MetricType::Counter,
    description: "Requests matched against a rule set. Tagged with action (none when no rule matched).",
};

pub const UPSTREAM_ERRORS: MetricDef = MetricDef {
    name: "upstream.errors",
    metric_type: MetricType::Counter,
    description: "Failed upstream requests. Tagged with kind (timeout, unreachable).",
};

pub const EMAIL_FORM_SPAM_SUPPRESSED: MetricDef = MetricDef {
    name: "email_form.spam_suppressed",
    metric_type: MetricType::Counter,
    description: "Form submissions dropped because the honeypot field was filled",
};

pub const EMAIL_FORM_SENT: MetricDef = MetricDef {
    name: "email_form.sent",
    metric_type: MetricType::Counter,
    description: "Form submissions delivered to the email service",
};

pub const ALL_METRICS: &[MetricDef] = &[
    REQUEST_DURATION,
    REQUESTS_INFLIGHT,
    RULE_RESOLVED,
    UPSTREAM_ERRORS,
    EMAIL_FORM_SPAM_SUPPRESSED,
    EMAIL_FORM_SENT,
];
