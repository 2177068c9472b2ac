//! Scenario catalogues, one per persona

use fixloop_kernel::{Persona, Severity};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Something a persona tries to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    /// Stable name
    pub name: String,
    /// What the persona is attempting, in their words
    pub goal: String,
    /// How much a failure here matters
    pub priority: Severity,
    /// Pages loaded, in order
    pub pages: Vec<String>,
    /// Pages that must refuse an unauthenticated visitor
    #[serde(default)]
    pub protected: Vec<String>,
}

impl Scenario {
    fn new(name: &str, goal: &str, priority: Severity, pages: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            goal: goal.to_string(),
            priority,
            pages: pages.iter().map(|p| (*p).to_string()).collect(),
            protected: Vec::new(),
        }
    }

    fn protecting(mut self, pages: &[&str]) -> Self {
        self.protected = pages.iter().map(|p| (*p).to_string()).collect();
        self
    }
}

/// How the persona sees the world; fed to the evaluation prompt
#[must_use]
pub fn outlook(persona: Persona) -> &'static str {
    match persona {
        Persona::Grandma => {
            "Grandma Rose, 78, not comfortable with technology. Wants to find videos of her \
             grandkids. Needs large text, obvious buttons and plain words."
        }
        Persona::Teen => {
            "A 16-year-old on a phone. Impatient with anything slow, notices ugly or dated \
             design, expects keyboard shortcuts and instant search."
        }
        Persona::Curator => {
            "Uncle Dave, the family archivist. Labels faces and edits metadata in bulk and \
             cares about accuracy and efficient workflows."
        }
        Persona::Security => {
            "A security auditor probing for authorization bypass, injection and information \
             disclosure."
        }
    }
}

/// Slowest acceptable page load for the persona
#[must_use]
pub fn patience(persona: Persona) -> Duration {
    match persona {
        Persona::Teen => Duration::from_secs(2),
        Persona::Grandma | Persona::Curator | Persona::Security => Duration::from_secs(3),
    }
}

/// Every scenario the persona runs
#[must_use]
pub fn catalogue(persona: Persona) -> Vec<Scenario> {
    use Severity::{Critical, High, Low, Medium};
    match persona {
        Persona::Grandma => vec![
            Scenario::new("find_grandkid_videos", "Find videos with my grandkids in them", High, &["/videos"]),
            Scenario::new("browse_people_page", "Find family members on the people page", High, &["/people"]),
            Scenario::new("watch_video", "Watch a video", Medium, &["/videos", "/videos/1"]),
            Scenario::new("use_search", "Search for something", High, &["/search"]),
            Scenario::new("navigate_home", "Find my way back to the home page", Medium, &["/people", "/"]),
        ],
        Persona::Teen => vec![
            Scenario::new("speed_test_all_pages", "Check every page loads fast", High, &["/", "/videos", "/people", "/search"]),
            Scenario::new("mobile_friendliness", "Use the site on my phone", High, &["/", "/videos"]),
            Scenario::new("search_speed", "Search and get results instantly", High, &["/search?q=beach"]),
            Scenario::new("ui_aesthetics", "Judge whether the design looks modern", Medium, &["/"]),
            Scenario::new("keyboard_shortcuts", "Navigate with the keyboard only", Low, &["/videos"]),
        ],
        Persona::Curator => vec![
            Scenario::new("labeling_workflow", "Label faces efficiently", High, &["/faces/unlabeled"]),
            Scenario::new("batch_operations", "Edit many videos at once", High, &["/videos"]),
            Scenario::new("data_accuracy", "Check the data shown is correct", High, &["/people", "/api/stats"]),
            Scenario::new("curator_tools", "Use curator-only tools", Medium, &["/admin"]),
            Scenario::new("export_capabilities", "Export the archive data", Low, &["/export"]),
        ],
        Persona::Security => vec![
            Scenario::new("authorization_bypass", "Reach protected pages without logging in", Critical, &[])
                .protecting(&["/admin", "/faces/unlabeled", "/export"]),
            Scenario::new("idor_testing", "Read other users' objects by id", Critical, &["/videos/1", "/videos/2"]),
            Scenario::new("input_validation", "Inject markup and SQL through inputs", High, &["/search?q=%3Cscript%3Ealert(1)%3C/script%3E", "/search?q=%27%20OR%201%3D1--"]),
            Scenario::new("authentication_testing", "Probe the login form", High, &["/login"]),
            Scenario::new("information_disclosure", "Look for leaked internals", Medium, &["/api/stats", "/does-not-exist"]),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_persona_has_scenarios_with_work_to_do() {
        for persona in Persona::ALL {
            let scenarios = catalogue(persona);
            assert!(!scenarios.is_empty(), "{persona}");
            for s in scenarios {
                assert!(!s.pages.is_empty() || !s.protected.is_empty(), "{}", s.name);
            }
        }
    }
}
