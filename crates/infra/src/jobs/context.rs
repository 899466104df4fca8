//! Per-execution facade handed to job logic.

use std::fmt;

use entitle_core::JobId;

use super::arguments::JobArguments;
use super::types::JobRecord;

/// What running job logic may see and report.
///
/// Built once per execution over the job's persisted record; results set here
/// land on the record and are persisted by the manager when the job returns.
#[derive(Debug)]
pub struct JobExecutionContext<'a> {
    record: &'a mut JobRecord,
}

impl<'a> JobExecutionContext<'a> {
    pub fn new(record: &'a mut JobRecord) -> Self {
        Self { record }
    }

    pub fn job_arguments(&self) -> &JobArguments {
        self.record.arguments()
    }

    /// Identity that scheduled the job, which may differ from whoever runs it.
    pub fn principal_name(&self) -> &str {
        self.record.principal()
    }

    pub fn job_id(&self) -> JobId {
        self.record.id()
    }

    pub fn job_key(&self) -> &str {
        self.record.job_key()
    }

    pub fn owner(&self) -> Option<&str> {
        self.record.owner()
    }

    /// 1-based number of the current attempt.
    pub fn attempt(&self) -> u32 {
        self.record.attempts()
    }

    /// Store `result` on the record, rendered as a display string.
    pub fn set_job_result(&mut self, result: impl fmt::Display) {
        self.record.set_result(result.to_string());
    }

    /// Store a formatted result, e.g. `ctx.set_job_result_fmt(format_args!("{n} pools"))`.
    pub fn set_job_result_fmt(&mut self, args: fmt::Arguments<'_>) {
        self.record.set_result(fmt::format(args));
    }
}
