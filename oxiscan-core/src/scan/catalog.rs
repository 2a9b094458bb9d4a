use oxiscan_model::ToolKind;

use crate::scan::job::{DomainScanPlan, ToolCommand};

/// Placeholder substituted with the target domain when a plan is rendered.
pub const DOMAIN_PLACEHOLDER: &str = "{domain}";

/// Default command templates for the bundled scanning tools.
///
/// This is a caller-side convenience: substitution happens here, when a plan
/// is rendered, so the orchestrator itself never interpolates anything.
/// Templates are argument vectors from the start - never shell strings.
#[derive(Clone, Debug)]
pub struct ToolCatalog {
    templates: Vec<(ToolKind, Vec<String>)>,
}

impl Default for ToolCatalog {
    fn default() -> Self {
        fn argv(parts: &[&str]) -> Vec<String> {
            parts.iter().map(|part| part.to_string()).collect()
        }

        Self {
            templates: vec![
                (ToolKind::NetworkScan, argv(&["nmap", "{domain}"])),
                (
                    ToolKind::SqlInjection,
                    argv(&["sqlmap", "-u", "https://{domain}"]),
                ),
                (
                    ToolKind::ContentDiscovery,
                    argv(&["gobuster", "dir", "-u", "https://{domain}", "-w", "common.txt"]),
                ),
                (ToolKind::XssTest, argv(&["xsstrike", "-u", "https://{domain}"])),
            ],
        }
    }
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces or appends the template for `tool`.
    pub fn with_tool(mut self, tool: ToolKind, template: Vec<String>) -> Self {
        match self
            .templates
            .iter_mut()
            .find(|(existing, _)| *existing == tool)
        {
            Some((_, argv)) => *argv = template,
            None => self.templates.push((tool, template)),
        }
        self
    }

    /// Renders the scan plan for one domain, substituting the domain into
    /// every template argument.
    pub fn plan_for(&self, domain: &str) -> DomainScanPlan {
        let mut plan = DomainScanPlan::new(domain);
        for (tool, template) in &self.templates {
            let command = template
                .iter()
                .map(|arg| arg.replace(DOMAIN_PLACEHOLDER, domain))
                .collect();
            plan.tools.push(ToolCommand::new(tool.clone(), command));
        }
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_renders_all_four_tools_in_order() {
        let plan = ToolCatalog::default().plan_for("example.com");
        assert_eq!(plan.domain, "example.com");
        let kinds: Vec<&ToolKind> = plan.tools.iter().map(|entry| &entry.tool).collect();
        assert_eq!(
            kinds,
            vec![
                &ToolKind::NetworkScan,
                &ToolKind::SqlInjection,
                &ToolKind::ContentDiscovery,
                &ToolKind::XssTest,
            ]
        );
    }

    #[test]
    fn substitution_touches_every_argument() {
        let plan = ToolCatalog::default().plan_for("example.com");
        assert_eq!(plan.tools[0].command, vec!["nmap", "example.com"]);
        assert_eq!(
            plan.tools[1].command,
            vec!["sqlmap", "-u", "https://example.com"]
        );
        for entry in &plan.tools {
            assert!(
                entry.command.iter().all(|arg| !arg.contains('{')),
                "unsubstituted placeholder in {:?}",
                entry.command
            );
        }
    }

    #[test]
    fn overriding_a_template_keeps_its_position() {
        let catalog = ToolCatalog::default().with_tool(
            ToolKind::NetworkScan,
            vec!["nmap".to_string(), "-sV".to_string(), "{domain}".to_string()],
        );
        let plan = catalog.plan_for("example.com");
        assert_eq!(plan.tools[0].command, vec!["nmap", "-sV", "example.com"]);
    }
}
