//! Database schema definitions

/// SQL to create all tables
pub const SCHEMA: &str = r#"
-- Campaigns
CREATE TABLE IF NOT EXISTS operations (
    id TEXT PRIMARY KEY,
    external_id TEXT NOT NULL UNIQUE,
    name TEXT NOT NULL,
    started_at TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Agent command results
CREATE TABLE IF NOT EXISTS executions (
    id TEXT PRIMARY KEY,
    operation_external_id TEXT NOT NULL REFERENCES operations(external_id),
    agent_host TEXT NOT NULL,
    agent_paw TEXT NOT NULL,
    link_id TEXT NOT NULL,
    command TEXT NOT NULL,
    pid INTEGER NOT NULL,
    status INTEGER NOT NULL,
    result_data TEXT NOT NULL DEFAULT '{}',
    agent_reported_at TEXT NOT NULL,
    link_state TEXT NOT NULL,
    raw_message TEXT NOT NULL DEFAULT 'null',
    created_at TEXT NOT NULL,
    UNIQUE(operation_external_id, link_id)
);

-- Planned detection attempts
CREATE TABLE IF NOT EXISTS detection_executions (
    id TEXT PRIMARY KEY,
    execution_id TEXT NOT NULL REFERENCES executions(id),
    operation_external_id TEXT NOT NULL REFERENCES operations(external_id),
    detection_type TEXT NOT NULL
        CHECK (detection_type IN ('api', 'windows', 'linux', 'darwin')),
    detection_platform TEXT NOT NULL,
    detection_config TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'running', 'completed', 'failed', 'cancelled')),
    started_at TEXT,
    completed_at TEXT,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    execution_metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    CHECK (retry_count >= 0 AND retry_count <= max_retries)
);

-- Worker observations, append-only
CREATE TABLE IF NOT EXISTS detection_results (
    id TEXT PRIMARY KEY,
    detection_execution_id TEXT NOT NULL REFERENCES detection_executions(id),
    detected INTEGER,
    raw_response TEXT NOT NULL DEFAULT 'null',
    parsed_results TEXT NOT NULL DEFAULT 'null',
    result_timestamp TEXT NOT NULL,
    result_source TEXT NOT NULL DEFAULT '',
    metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

-- Indexes for common queries
CREATE INDEX IF NOT EXISTS idx_executions_operation ON executions(operation_external_id);
CREATE INDEX IF NOT EXISTS idx_detection_executions_execution
    ON detection_executions(execution_id);
CREATE INDEX IF NOT EXISTS idx_detection_executions_status
    ON detection_executions(status);
CREATE INDEX IF NOT EXISTS idx_detection_executions_created
    ON detection_executions(created_at);
CREATE INDEX IF NOT EXISTS idx_detection_results_execution
    ON detection_results(detection_execution_id);
"#;
