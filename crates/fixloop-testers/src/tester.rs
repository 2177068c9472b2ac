//! Persona tester: load pages, apply mechanical checks, ask for one judgement

use crate::evaluate::{evaluate_experience, evaluation_prompt};
use crate::probe::{PageLoad, PageProbe};
use crate::scenario::{catalogue, patience, Scenario};
use fixloop_kernel::{Category, Issue, IssueId, Oracle, Persona, Severity};
use std::fmt::Write as _;
use std::sync::Arc;
use ulid::Ulid;

/// Body excerpt included in the evaluation context
const BODY_EXCERPT: usize = 2000;
/// Completion budget for one evaluation
const EVALUATION_MAX_TOKENS: u32 = 800;

/// One persona driving the app under test
pub struct Tester {
    persona: Persona,
    probe: Arc<dyn PageProbe>,
    oracle: Arc<dyn Oracle>,
}

impl std::fmt::Debug for Tester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tester").field("persona", &self.persona).finish_non_exhaustive()
    }
}

impl Tester {
    /// Tester for `persona`
    #[must_use]
    pub fn new(persona: Persona, probe: Arc<dyn PageProbe>, oracle: Arc<dyn Oracle>) -> Self {
        Self {
            persona,
            probe,
            oracle,
        }
    }

    /// Persona being played
    #[must_use]
    pub fn persona(&self) -> Persona {
        self.persona
    }

    fn issue_id(&self) -> IssueId {
        IssueId::new(format!("{}-{}", self.persona.reporter_name(), Ulid::new()))
    }

    fn mechanical_issue(
        &self,
        scenario: &Scenario,
        title: String,
        description: String,
        severity: Severity,
        category: Category,
    ) -> Issue {
        Issue::new(self.issue_id().0, title, description, self.persona.reporter_name())
            .with_severity(severity)
            .with_category(category)
            .with_steps(vec![format!("Scenario: {}", scenario.goal)])
    }

    /// Run one scenario and return what it found
    pub async fn run_scenario(&self, scenario: &Scenario) -> Vec<Issue> {
        let limit = patience(self.persona);
        let mut issues = Vec::new();
        let mut loads: Vec<PageLoad> = Vec::new();

        for path in &scenario.pages {
            let load = self.probe.load(path).await;
            if load.elapsed > limit {
                issues.push(
                    self.mechanical_issue(
                        scenario,
                        format!("{path} is too slow to load"),
                        format!(
                            "The page took {:.1}s; more than {}s is too long.",
                            load.elapsed.as_secs_f64(),
                            limit.as_secs()
                        ),
                        Severity::Medium,
                        Category::Performance,
                    )
                    .with_outcome(format!("loads within {}s", limit.as_secs()), format!("{:.1}s", load.elapsed.as_secs_f64())),
                );
            }
            if load.status == 0 || load.status >= 500 {
                issues.push(
                    self.mechanical_issue(
                        scenario,
                        format!("Cannot load {path}"),
                        format!("Requesting {path} failed with status {}.", load.status),
                        Severity::High,
                        Category::Bug,
                    )
                    .with_outcome("page loads", format!("status {}", load.status)),
                );
            }
            loads.push(load);
        }

        for path in &scenario.protected {
            let load = self.probe.load(path).await;
            if load.is_ok() && !looks_like_login(&load.body) {
                issues.push(
                    self.mechanical_issue(
                        scenario,
                        format!("{path} is reachable without logging in"),
                        format!("An unauthenticated request to {path} returned {}.", load.status),
                        Severity::Critical,
                        Category::Security,
                    )
                    .with_outcome("redirect to login or 401/403", format!("status {}", load.status)),
                );
            }
        }

        if !loads.is_empty() {
            let prompt = evaluation_prompt(self.persona, &describe(scenario, &loads));
            match self.oracle.ask(&prompt, EVALUATION_MAX_TOKENS).await {
                Ok(reply) => {
                    if let Some(mut issue) = evaluate_experience(self.persona, self.issue_id(), &reply.text) {
                        issue.steps_to_reproduce = scenario.pages.iter().map(|p| format!("Open {p}")).collect();
                        issues.push(issue);
                    }
                }
                Err(e) => tracing::warn!(persona = %self.persona, scenario = %scenario.name, error = %e, "evaluation skipped"),
            }
        }
        issues
    }

    /// Run the persona's whole catalogue
    pub async fn run_all(&self) -> Vec<Issue> {
        let mut issues = Vec::new();
        for scenario in catalogue(self.persona) {
            tracing::info!(persona = %self.persona, scenario = %scenario.name, "running scenario");
            issues.extend(self.run_scenario(&scenario).await);
        }
        issues
    }
}

fn looks_like_login(body: &str) -> bool {
    let lower = body.to_lowercase();
    lower.contains("type=\"password\"") || lower.contains("log in") || lower.contains("login")
}

fn describe(scenario: &Scenario, loads: &[PageLoad]) -> String {
    let mut out = format!("Goal: {}\n", scenario.goal);
    for load in loads {
        let excerpt: String = load.body.chars().take(BODY_EXCERPT).collect();
        let _ = write!(
            out,
            "\nLoaded {} (status {}, {:.1}s):\n{}\n",
            load.path,
            load.status,
            load.elapsed.as_secs_f64(),
            excerpt
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use fixloop_kernel::{OracleError, OracleReply, TokenUsage};
    use std::collections::HashMap;
    use std::time::Duration;

    struct FakeProbe(HashMap<&'static str, (u16, &'static str, u64)>);

    #[async_trait]
    impl PageProbe for FakeProbe {
        async fn load(&self, path: &str) -> PageLoad {
            let (status, body, ms) = self.0.get(path).copied().unwrap_or((404, "missing", 10));
            PageLoad {
                path: path.to_string(),
                status,
                body: body.to_string(),
                elapsed: Duration::from_millis(ms),
            }
        }
    }

    struct FixedOracle(&'static str);

    #[async_trait]
    impl Oracle for FixedOracle {
        async fn ask(&self, _prompt: &str, _max: u32) -> Result<OracleReply, OracleError> {
            Ok(OracleReply {
                text: self.0.to_string(),
                usage: TokenUsage::new(10, 10),
            })
        }
    }

    fn tester(persona: Persona, pages: &[(&'static str, (u16, &'static str, u64))], reply: &'static str) -> Tester {
        Tester::new(
            persona,
            Arc::new(FakeProbe(pages.iter().copied().collect())),
            Arc::new(FixedOracle(reply)),
        )
    }

    #[tokio::test]
    async fn slow_page_and_judgement_both_reported() {
        let t = tester(
            Persona::Grandma,
            &[("/videos", (200, "<html>videos</html>", 4500))],
            r#"{"found_issue": true, "title": "No way to filter by person", "category": "feature"}"#,
        );
        let scenario = &catalogue(Persona::Grandma)[0];
        let issues = t.run_scenario(scenario).await;
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].category, Category::Performance);
        assert_eq!(issues[1].category, Category::Feature);
        assert_eq!(issues[1].steps_to_reproduce, vec!["Open /videos".to_string()]);
        assert_ne!(issues[0].id, issues[1].id);
    }

    #[tokio::test]
    async fn unprotected_admin_page_is_a_security_issue() {
        let t = tester(
            Persona::Security,
            &[
                ("/admin", (200, "<h1>Admin panel</h1>", 5)),
                ("/faces/unlabeled", (302, "", 5)),
                ("/export", (200, "<form>Login</form>", 5)),
            ],
            r#"{"found_issue": false}"#,
        );
        let scenario = catalogue(Persona::Security)
            .into_iter()
            .find(|s| s.name == "authorization_bypass")
            .unwrap();
        let issues = t.run_scenario(&scenario).await;
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, Severity::Critical);
        assert!(issues[0].title.contains("/admin"));
    }

    #[tokio::test]
    async fn healthy_scenario_yields_nothing() {
        let t = tester(
            Persona::Teen,
            &[("/", (200, "home", 100))],
            r#"{"found_issue": false, "comment": "ok"}"#,
        );
        let scenario = catalogue(Persona::Teen)
            .into_iter()
            .find(|s| s.name == "ui_aesthetics")
            .unwrap();
        assert!(t.run_scenario(&scenario).await.is_empty());
    }
}
