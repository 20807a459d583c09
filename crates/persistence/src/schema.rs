// Diesel schema for the workflow engine's durable tables. Timestamps are
// stored as epoch milliseconds (`BigInt`) rather than a native timestamp
// type so the schema works unmodified against both the SQLite and Postgres
// backends, the same trick a prior `flows`/`flow_data` schema used
// (`created_at_ts -> BigInt`).

use diesel::allow_tables_to_appear_in_same_query;

diesel::table! {
    workflow_definitions (workflow_id, version) {
        workflow_id -> Text,
        version -> BigInt,
        name -> Text,
        description -> Text,
        category -> Text,
        steps_json -> Text,
        entry_points_json -> Text,
        exit_points_json -> Text,
        ai_configurable -> Bool,
    }
}

diesel::table! {
    workflow_executions (execution_id) {
        execution_id -> Text,
        workflow_id -> Text,
        workflow_version -> BigInt,
        principal_id -> Text,
        session_id -> Text,
        status -> Text,
        current_steps_json -> Text,
        started_at_ms -> BigInt,
        updated_at_ms -> BigInt,
        completed_at_ms -> Nullable<BigInt>,
        error_json -> Nullable<Text>,
    }
}

diesel::table! {
    step_executions (execution_id, step_id) {
        execution_id -> Text,
        step_id -> Text,
        status -> Text,
        attempt -> Integer,
        started_at_ms -> Nullable<BigInt>,
        finished_at_ms -> Nullable<BigInt>,
        duration_ms -> Nullable<BigInt>,
        input_snapshot_json -> Text,
        output_json -> Nullable<Text>,
        error_json -> Nullable<Text>,
    }
}

diesel::table! {
    context_commits (id) {
        id -> Text,
        execution_id -> Text,
        version -> BigInt,
        step_id -> Text,
        delta_json -> Text,
        committed_at_ms -> BigInt,
    }
}

allow_tables_to_appear_in_same_query!(workflow_definitions, workflow_executions, step_executions, context_commits);
