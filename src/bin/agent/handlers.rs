use sandboxed_rpa::{AgentConfig, JobAction, JobDescriptor, JobResult, ProgressUpdate};
use tracing::{info, warn};

use crate::agent_loop::{AgentLoop, LoopSettings, Model, Page};
use crate::brain::describe_prompt;
use crate::dom::truncate_text;
use crate::types::{DEFAULT_AGENT_GOAL, DEFAULT_DESCRIBE_REQUEST, DESCRIBE_TEXT_LIMIT};

/// Run one job against an already launched browser. Always yields a result.
pub async fn run_job<P, M>(
    page: &mut P,
    model: &M,
    descriptor: &JobDescriptor,
    config: &AgentConfig,
    progress: impl FnMut(ProgressUpdate),
) -> JobResult
where
    P: Page,
    M: Model,
{
    info!(url = %descriptor.url, "navigating");
    if let Err(e) = page.navigate(&descriptor.url).await {
        return JobResult::failure(format!("could not goto: {e:#}"));
    }

    match descriptor.action {
        JobAction::Scrape => scrape(page).await,
        JobAction::Describe => {
            let request = descriptor.instruction().unwrap_or(DEFAULT_DESCRIBE_REQUEST);
            describe(page, model, request).await
        }
        JobAction::AgentAct => {
            let goal = descriptor.instruction().unwrap_or(DEFAULT_AGENT_GOAL);
            AgentLoop::new(LoopSettings::from(config))
                .run(page, model, goal, progress)
                .await
                .into_job_result()
        }
    }
}

async fn scrape<P: Page>(page: &mut P) -> JobResult {
    match page.content().await {
        Ok(html) => JobResult::success(html),
        Err(e) => JobResult::failure(format!("could not get content: {e:#}")),
    }
}

async fn describe<P: Page, M: Model>(page: &mut P, model: &M, request: &str) -> JobResult {
    let screenshot = match page.screenshot().await {
        Ok(shot) => shot,
        Err(e) => return JobResult::failure(format!("could not take screenshot: {e:#}")),
    };

    let text = match page.page_text().await {
        Ok(text) => truncate_text(&text, DESCRIBE_TEXT_LIMIT),
        Err(e) => {
            warn!(error = %e, "page text unavailable, describing from the screenshot only");
            "(page text unavailable)".to_string()
        }
    };

    match model.generate(&describe_prompt(&text, request), &screenshot).await {
        Ok(answer) => JobResult::success(answer).with_image(screenshot),
        Err(e) => JobResult::failure(format!("could not contact model: {e}")).with_image(screenshot),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::InferenceError;
    use crate::testing::{FakePage, ScriptedModel};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn config() -> AgentConfig {
        AgentConfig {
            settle_delay: Duration::ZERO,
            final_settle: Duration::ZERO,
            ..Default::default()
        }
    }

    fn job(action: JobAction, target: Option<&str>) -> JobDescriptor {
        JobDescriptor::new(action, "https://example.com", target.map(String::from))
    }

    #[tokio::test]
    async fn scrape_returns_markup() {
        let mut page = FakePage::with_elements(Vec::new());
        let model = ScriptedModel::new(Vec::new());

        let result = run_job(&mut page, &model, &job(JobAction::Scrape, None), &config(), |_| {}).await;

        assert!(result.success);
        assert_eq!(result.data.as_deref(), Some("<html><body>Example page</body></html>"));
        assert_eq!(result.error, None);
        assert_eq!(page.visited, vec!["https://example.com"]);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn navigation_failure_is_fatal() {
        let mut page = FakePage {
            fail_navigation: Some("net::ERR_NAME_NOT_RESOLVED".into()),
            ..Default::default()
        };
        let model = ScriptedModel::new(Vec::new());

        let result = run_job(&mut page, &model, &job(JobAction::Scrape, None), &config(), |_| {}).await;

        assert!(!result.success);
        assert_eq!(result.data, None);
        assert_eq!(
            result.error.as_deref(),
            Some("could not goto: net::ERR_NAME_NOT_RESOLVED")
        );
    }

    #[tokio::test]
    async fn describe_uses_default_request_and_attaches_screenshot() {
        let mut page = FakePage::with_elements(Vec::new());
        let model = ScriptedModel::repeating("A plain example page.");

        let result =
            run_job(&mut page, &model, &job(JobAction::Describe, Some("  ")), &config(), |_| {}).await;

        assert!(result.success);
        assert_eq!(result.data.as_deref(), Some("A plain example page."));
        assert_eq!(result.image.as_deref(), Some("shot-1"));
        let prompt = &model.prompts()[0];
        assert!(prompt.contains("*** USER REQUEST ***\nExplain what this page is."));
        assert!(prompt.contains("Example page"));
    }

    #[tokio::test]
    async fn describe_survives_missing_text() {
        let mut page = FakePage::with_elements(Vec::new());
        page.fail_text = true;
        let model = ScriptedModel::repeating("Looks like a blog.");

        let result =
            run_job(&mut page, &model, &job(JobAction::Describe, Some("what is it?")), &config(), |_| {})
                .await;

        assert!(result.success);
        assert!(model.prompts()[0].contains("(page text unavailable)"));
    }

    #[tokio::test]
    async fn describe_reports_model_failure() {
        let mut page = FakePage::with_elements(Vec::new());
        let model = ScriptedModel::new(vec![Err(InferenceError::MissingResponse)]);

        let result = run_job(&mut page, &model, &job(JobAction::Describe, None), &config(), |_| {}).await;

        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("could not contact model"));
    }

    #[tokio::test]
    async fn agent_emits_progress_per_round() {
        let mut page = FakePage::with_elements(Vec::new());
        let model = ScriptedModel::new(vec![
            Ok(r#"[{"action":"press"}]"#.into()),
            Ok(r#"[{"action":"finish","result":"submitted"}]"#.into()),
        ]);
        let mut updates = Vec::new();

        let result = run_job(
            &mut page,
            &model,
            &job(JobAction::AgentAct, None),
            &config(),
            |u| updates.push(u.image),
        )
        .await;

        assert!(result.success);
        assert_eq!(updates, vec!["shot-1", "shot-2"]);
        assert_eq!(page.actions, vec!["press Enter"]);
        assert!(model.prompts()[0].contains("Do something on this page."));
    }
}
