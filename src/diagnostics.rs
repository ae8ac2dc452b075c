//! Plain-text report rendering for a finished session. Halts and failures
//! already get their own banner from [`crate::error::CoreError::diagnostic_banner`];
//! this module covers the complementary case, a normal `completed` session.

use crate::store::Session;

/// Renders the final-report text printed by the CLI after a session reaches
/// `completed`. Anything beyond this plain-text summary (HTML, structured
/// export) is out of scope.
pub fn render_completion_report(session: &Session, iteration_count: u32) -> String {
    let banner = "=".repeat(72);
    let mut out = format!("{banner}\nBISECTION COMPLETE\n{banner}\n\n");
    out.push_str(&format!("session:    {}\n", session.id));
    out.push_str(&format!("good:       {}\n", session.good_commit));
    out.push_str(&format!("bad:        {}\n", session.bad_commit));
    out.push_str(&format!("iterations: {iteration_count}\n"));
    match &session.result_commit {
        Some(sha) => out.push_str(&format!("\nfirst bad commit: {sha}\n")),
        None => out.push_str("\nfirst bad commit: not determined\n"),
    }
    out.push_str(&format!("\n{banner}\n"));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SessionStatus;

    fn sample_session() -> Session {
        Session {
            id: "s1".to_string(),
            good_commit: "a".repeat(40),
            bad_commit: "b".repeat(40),
            started_at: 0,
            ended_at: Some(1),
            status: SessionStatus::Completed,
            result_commit: Some("c".repeat(40)),
            config_blob: Vec::new(),
            state_blob: Vec::new(),
            error: None,
        }
    }

    #[test]
    fn completion_report_includes_result_commit() {
        let session = sample_session();
        let report = render_completion_report(&session, 7);
        assert!(report.contains(&session.result_commit.clone().unwrap()));
        assert!(report.contains("iterations: 7"));
    }

    #[test]
    fn completion_report_handles_undetermined_result() {
        let mut session = sample_session();
        session.result_commit = None;
        let report = render_completion_report(&session, 3);
        assert!(report.contains("first bad commit: not determined"));
    }
}
