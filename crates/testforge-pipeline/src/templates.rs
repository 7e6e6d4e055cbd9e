//! Named text templates with `{{ variable }}` placeholders.

use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use testforge_core::{Error, PipelineConfig, Project, Result};
use tokio::fs;
use tracing::debug;

/// Package descriptor.
pub const PACKAGE: &str = "package";
/// Test-runner configuration.
pub const RUNNER_CONFIG: &str = "runner-config";
/// Environment file.
pub const ENV: &str = "env";
/// Shared scenario state.
pub const WORLD: &str = "world";
/// Scenario hooks.
pub const HOOKS: &str = "hooks";
/// API fixture data.
pub const FIXTURES: &str = "fixtures";
/// Synthetic feature run by the health check.
pub const HEALTH_CHECK_FEATURE: &str = "health-check-feature";
/// Step definitions for the synthetic feature.
pub const HEALTH_CHECK_STEPS: &str = "health-check-steps";
/// Known-good package descriptor written by compensation.
pub const BASELINE_PACKAGE: &str = "baseline-package";
/// Known-good runner configuration written by compensation.
pub const BASELINE_RUNNER_CONFIG: &str = "baseline-runner-config";

const PLACEHOLDER_PATTERN: &str = r"\{\{\s*(\w+)\s*\}\}";

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> Result<&'static Regex> {
    if let Some(regex) = PLACEHOLDER.get() {
        return Ok(regex);
    }
    let regex = Regex::new(PLACEHOLDER_PATTERN)
        .map_err(|err| Error::Template(format!("invalid placeholder pattern: {err}")))?;
    Ok(PLACEHOLDER.get_or_init(|| regex))
}

/// Variables available to every template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateVars {
    values: BTreeMap<&'static str, String>,
}

impl TemplateVars {
    /// Builds the variable set for one project.
    pub fn for_project(project: &Project, config: &PipelineConfig) -> Self {
        let base_url = if project.base_url.is_empty() {
            config.base_url.clone()
        } else {
            project.base_url.clone()
        };
        let values = BTreeMap::from([
            ("project_name", project.name.clone()),
            ("base_url", base_url),
            ("author", config.author.clone()),
            ("description", config.description.clone()),
        ]);
        Self { values }
    }

    /// Looks up a variable.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }
}

/// Registry of named templates.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    templates: HashMap<String, String>,
}

impl TemplateSet {
    /// Returns the built-in templates.
    pub fn builtin() -> Self {
        let templates = [
            (PACKAGE, PACKAGE_TEMPLATE),
            (RUNNER_CONFIG, RUNNER_CONFIG_TEMPLATE),
            (ENV, ENV_TEMPLATE),
            (WORLD, WORLD_TEMPLATE),
            (HOOKS, HOOKS_TEMPLATE),
            (FIXTURES, FIXTURES_TEMPLATE),
            (HEALTH_CHECK_FEATURE, HEALTH_CHECK_FEATURE_TEMPLATE),
            (HEALTH_CHECK_STEPS, HEALTH_CHECK_STEPS_TEMPLATE),
            (BASELINE_PACKAGE, BASELINE_PACKAGE_TEMPLATE),
            (BASELINE_RUNNER_CONFIG, BASELINE_RUNNER_CONFIG_TEMPLATE),
        ]
        .into_iter()
        .map(|(name, body)| (name.to_owned(), body.to_owned()))
        .collect();
        Self { templates }
    }

    /// Built-in templates overridden by any `<name>.tmpl` file in `dir`.
    ///
    /// # Errors
    /// Returns an error if `dir` exists but cannot be read
    pub async fn load(dir: Option<&Path>) -> Result<Self> {
        let mut set = Self::builtin();
        let Some(dir) = dir else {
            return Ok(set);
        };

        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(dir = %dir.display(), "Template directory missing, using built-ins");
                return Ok(set);
            }
            Err(err) => return Err(err.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("tmpl") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let body = fs::read_to_string(&path).await?;
            debug!(template = name, path = %path.display(), "Loaded template override");
            set.insert(name, body);
        }

        Ok(set)
    }

    /// Registers or replaces a template.
    pub fn insert(&mut self, name: impl Into<String>, body: impl Into<String>) {
        self.templates.insert(name.into(), body.into());
    }

    /// Returns whether a template is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.templates.contains_key(name)
    }

    /// Renders a template.
    ///
    /// # Errors
    /// Returns `TemplateNotFound` for unknown names and `Template` for
    /// placeholders with no matching variable
    pub fn render(&self, name: &str, vars: &TemplateVars) -> Result<String> {
        let body = self
            .templates
            .get(name)
            .ok_or_else(|| Error::TemplateNotFound(name.to_owned()))?;

        let mut rendered = String::with_capacity(body.len());
        let mut last = 0;
        for captures in placeholder()?.captures_iter(body) {
            let (Some(whole), Some(var)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            let value = vars.get(var.as_str()).ok_or_else(|| {
                Error::Template(format!(
                    "template '{name}' uses unknown variable '{}'",
                    var.as_str()
                ))
            })?;
            rendered.push_str(&body[last..whole.start()]);
            rendered.push_str(value);
            last = whole.end();
        }
        rendered.push_str(&body[last..]);
        Ok(rendered)
    }
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::builtin()
    }
}

const PACKAGE_TEMPLATE: &str = r#"{
  "name": "{{ project_name }}",
  "version": "1.0.0",
  "private": true,
  "description": "{{ description }}",
  "author": "{{ author }}",
  "scripts": {
    "bddgen": "bddgen",
    "test": "bddgen && playwright test",
    "report": "playwright show-report reports/html"
  },
  "devDependencies": {
    "@playwright/test": "^1.48.0",
    "dotenv": "^16.4.5",
    "playwright-bdd": "^7.4.0",
    "typescript": "^5.6.0"
  }
}
"#;

const RUNNER_CONFIG_TEMPLATE: &str = r"import 'dotenv/config';
import { defineConfig } from '@playwright/test';
import { defineBddConfig } from 'playwright-bdd';

const testDir = defineBddConfig({
  features: 'features/**/*.feature',
  steps: ['steps/**/*.ts', 'support/**/*.ts'],
});

export default defineConfig({
  testDir,
  outputDir: 'test-results',
  reporter: [['list'], ['html', { outputFolder: 'reports/html', open: 'never' }]],
  use: {
    baseURL: process.env.BASE_URL ?? '{{ base_url }}',
    extraHTTPHeaders: { Accept: 'application/json' },
  },
});
";

const ENV_TEMPLATE: &str = "BASE_URL={{ base_url }}\nPROJECT_NAME={{ project_name }}\n";

const WORLD_TEMPLATE: &str = r"import { test as base } from 'playwright-bdd';
import type { APIRequestContext, APIResponse } from '@playwright/test';

export type World = {
  api: APIRequestContext;
  lastResponse?: APIResponse;
};

export const test = base.extend<{ world: World }>({
  world: async ({ request }, use) => {
    await use({ api: request });
  },
});
";

const HOOKS_TEMPLATE: &str = r"import { createBdd } from 'playwright-bdd';
import { test } from './world';

const { BeforeScenario, AfterScenario } = createBdd(test);

BeforeScenario(async ({ world }) => {
  world.lastResponse = undefined;
});

AfterScenario(async ({ world, $testInfo }) => {
  if ($testInfo.status !== 'passed' && world.lastResponse) {
    await $testInfo.attach('last-response', {
      body: await world.lastResponse.text(),
      contentType: 'application/json',
    });
  }
});
";

const FIXTURES_TEMPLATE: &str = r#"{
  "project": "{{ project_name }}",
  "baseUrl": "{{ base_url }}",
  "health": {
    "path": "/health",
    "expectedStatusBelow": 500
  }
}
"#;

const HEALTH_CHECK_FEATURE_TEMPLATE: &str = r#"Feature: {{ project_name }} health check

  Scenario: API answers on its base URL
    Given the API at "{{ base_url }}"
    When I request "/health"
    Then the response status is below 500
"#;

const HEALTH_CHECK_STEPS_TEMPLATE: &str = r"import { expect } from '@playwright/test';
import { createBdd } from 'playwright-bdd';
import { test } from '../support/world';

const { Given, When, Then } = createBdd(test);

let target = '';

Given('the API at {string}', async ({}, baseUrl: string) => {
  target = baseUrl;
});

When('I request {string}', async ({ world }, path: string) => {
  world.lastResponse = await world.api.get(new URL(path, target).toString());
});

Then('the response status is below {int}', async ({ world }, limit: number) => {
  expect(world.lastResponse?.status() ?? limit).toBeLessThan(limit);
});
";

const BASELINE_PACKAGE_TEMPLATE: &str = r#"{
  "name": "{{ project_name }}",
  "version": "1.0.0",
  "private": true,
  "scripts": {
    "test": "playwright test"
  },
  "devDependencies": {
    "@playwright/test": "^1.48.0"
  }
}
"#;

const BASELINE_RUNNER_CONFIG_TEMPLATE: &str = r"import { defineConfig } from '@playwright/test';

export default defineConfig({
  testDir: 'tests',
  use: {
    baseURL: '{{ base_url }}',
  },
});
";
