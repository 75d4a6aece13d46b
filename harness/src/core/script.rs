//! Dockerfile and entrypoint-script rendering.
//!
//! Both artifacts are rendered from embedded minijinja templates. The
//! Dockerfile template text doubles as the build-template fingerprint mixed
//! into every image identity, so editing it invalidates cached images.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::spec::EnvironmentSpec;

pub const DOCKERFILE_TEMPLATE: &str = include_str!("../templates/Dockerfile.j2");
const EVAL_SCRIPT_TEMPLATE: &str = include_str!("../templates/eval.sh.j2");

/// Exit status of the entrypoint when a patch fails to apply.
pub const PATCH_FAILURE_EXIT_CODE: i64 = 97;

/// Placeholder target used when an instance names no tests, so a report is still produced.
pub const PLACEHOLDER_TEST: &str = "my_dummy_test_that_has_a_very_unique_name.py";

const REPORT_FLAGS: &str = "--tb=short --json-report --json-report-file=/pass_report.json -W ignore::DeprecationWarning";

/// Proxy and certificate settings baked into the Dockerfile.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProxySettings {
    pub http_proxy: String,
    pub https_proxy: String,
    /// Certificate file names as they appear at the root of the build context.
    pub certificates: Vec<String>,
}

/// Inputs for the container entrypoint.
#[derive(Debug, Clone)]
pub struct EvalScriptInputs<'a> {
    pub tests: &'a [String],
    pub test_cmd: &'a str,
    pub install: &'a str,
    pub eval_commands: &'a [String],
    /// Hard per-test timeout in seconds.
    pub per_test_timeout_secs: u64,
    pub failfast: bool,
}

struct ScriptEngine {
    env: Environment<'static>,
}

impl ScriptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("Dockerfile", DOCKERFILE_TEMPLATE)
            .expect("Dockerfile template should be valid");
        env.add_template("eval.sh", EVAL_SCRIPT_TEMPLATE)
            .expect("eval.sh template should be valid");
        Self { env }
    }
}

/// Quote a word for POSIX `sh`, leaving safe words untouched.
pub fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r#"'"'"'"#))
    }
}

/// Final test invocation: report flags, failfast, per-test timeout, and quoted targets.
pub fn compose_test_command(
    test_cmd: &str,
    tests: &[String],
    per_test_timeout_secs: u64,
    failfast: bool,
) -> String {
    let mut cmd = test_cmd.to_string();
    if !cmd.contains("json-report") {
        cmd.push(' ');
        cmd.push_str(REPORT_FLAGS);
    }
    if tests.is_empty() {
        return format!("echo 'No test to run' && {cmd} {PLACEHOLDER_TEST}");
    }
    if failfast && !cmd.contains("-x ") && !cmd.contains("--exitfirst") {
        cmd.push_str(" --exitfirst");
    }
    let targets: Vec<String> = tests.iter().map(|t| shell_quote(t)).collect();
    format!(
        "{cmd} --timeout {per_test_timeout_secs} {}",
        targets.join(" ")
    )
}

/// Loosen dependency resolution for every `pip install` in the install command.
pub fn loosen_install(install: &str) -> String {
    install.replace("pip install", "pip install --no-deps --no-build-isolation")
}

/// Render the container entrypoint script.
pub fn render_eval_script(inputs: &EvalScriptInputs<'_>) -> Result<String> {
    let engine = ScriptEngine::new();
    let template = engine.env.get_template("eval.sh")?;
    let test_cmd = compose_test_command(
        inputs.test_cmd,
        inputs.tests,
        inputs.per_test_timeout_secs,
        inputs.failfast,
    );
    let install = loosen_install(inputs.install.trim());
    let mut rendered = template.render(context! {
        install => install,
        eval_commands => inputs.eval_commands,
        test_cmd => test_cmd,
        patch_failure_exit_code => PATCH_FAILURE_EXIT_CODE,
    })?;
    rendered.push('\n');
    Ok(rendered)
}

/// Pre-install steps joined for a single `RUN`: `true` when empty, with
/// `apt-get update` prepended unless already listed.
pub fn pre_install_line(pre_install: &[String]) -> String {
    if pre_install.is_empty() {
        return "true".to_string();
    }
    let mut steps: Vec<&str> = Vec::with_capacity(pre_install.len() + 1);
    if !pre_install.iter().any(|s| s == "apt-get update") {
        steps.push("apt-get update");
    }
    steps.extend(pre_install.iter().map(String::as_str));
    steps.join(" && ")
}

/// `uv pip install` commands for the free-form package string and the quoted package list.
pub fn pip_install_commands(spec: &EnvironmentSpec) -> Vec<String> {
    let mut cmds = Vec::new();
    if let Some(packages) = spec.packages.as_deref().map(str::trim)
        && !packages.is_empty()
    {
        cmds.push(format!("uv pip install --system -U {packages}"));
    }
    if !spec.pip_packages.is_empty() {
        let quoted: Vec<String> = spec
            .pip_packages
            .iter()
            .map(|p| format!("\"{p}\""))
            .collect();
        cmds.push(format!("uv pip install --system -U {}", quoted.join(" ")));
    }
    cmds
}

/// Render the image Dockerfile for a source tree copied in as `repo_dir`.
pub fn render_dockerfile(
    spec: &EnvironmentSpec,
    repo_dir: &str,
    proxy: Option<&ProxySettings>,
) -> Result<String> {
    let engine = ScriptEngine::new();
    let template = engine.env.get_template("Dockerfile")?;
    let mut rendered = template.render(context! {
        python => spec.runtime_version(),
        proxy => proxy,
        repo_dir => repo_dir,
        pre_install => pre_install_line(&spec.pre_install),
        pip_install => pip_install_commands(spec),
    })?;
    rendered.push('\n');
    Ok(rendered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> EnvironmentSpec {
        EnvironmentSpec {
            python: "3.11".to_string(),
            packages: Some("numpy<2".to_string()),
            pip_packages: vec!["pytest==8.0".to_string()],
            pre_install: vec!["apt-get install -y gcc".to_string()],
            install: "pip install -e .".to_string(),
            test_cmd: "pytest".to_string(),
            eval_commands: vec!["export FOO=1".to_string()],
        }
    }

    fn tests_of(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn empty_targets_use_placeholder() {
        let cmd = compose_test_command("pytest", &[], 10, true);
        assert_eq!(
            cmd,
            format!("echo 'No test to run' && pytest {REPORT_FLAGS} {PLACEHOLDER_TEST}")
        );
        assert!(cmd.contains("--json-report-file"));

        let own = compose_test_command("pytest --json-report", &[], 10, false);
        assert_eq!(
            own,
            format!("echo 'No test to run' && pytest --json-report {PLACEHOLDER_TEST}")
        );
    }

    #[test]
    fn appends_report_flags_timeout_and_quoted_targets() {
        let cmd = compose_test_command("pytest", &tests_of(&["a.py::t[x y]", "b.py"]), 30, false);
        assert_eq!(
            cmd,
            format!("pytest {REPORT_FLAGS} --timeout 30 'a.py::t[x y]' b.py")
        );
    }

    #[test]
    fn failfast_is_added_once() {
        let tests = tests_of(&["a.py"]);
        assert!(compose_test_command("pytest", &tests, 5, true).contains(" --exitfirst"));
        let cmd = compose_test_command("pytest -x ", &tests, 5, true);
        assert!(!cmd.contains("--exitfirst"));
    }

    #[test]
    fn existing_report_flag_is_respected() {
        let cmd = compose_test_command("pytest --json-report", &tests_of(&["a.py"]), 5, false);
        assert!(!cmd.contains("--tb=short"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
        assert_eq!(shell_quote("a/b.py::c"), "a/b.py::c");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn eval_script_orders_steps() {
        let spec = spec();
        let tests = tests_of(&["tests/test_a.py"]);
        let script = render_eval_script(&EvalScriptInputs {
            tests: &tests,
            test_cmd: &spec.test_cmd,
            install: &spec.install,
            eval_commands: &spec.eval_commands,
            per_test_timeout_secs: 60,
            failfast: false,
        })
        .expect("render");
        let checkout = script.find("git checkout").expect("checkout");
        let patches = script.find("/patches/*.patch").expect("patches");
        let install = script
            .find("pip install --no-deps --no-build-isolation -e .")
            .expect("install");
        let eval = script.find("export FOO=1").expect("eval command");
        let test = script.find("--timeout 60 tests/test_a.py").expect("test");
        assert!(checkout < patches && patches < install && install < eval && eval < test);
        assert!(script.contains(&format!("exit {PATCH_FAILURE_EXIT_CODE}")));
        assert!(script.contains("2> /results/test_err.txt"));
    }

    #[test]
    fn dockerfile_includes_packages_and_pre_install() {
        let dockerfile = render_dockerfile(&spec(), "owner__repo", None).expect("render");
        assert!(dockerfile.starts_with("FROM python:3.11-slim"));
        assert!(dockerfile.contains("COPY owner__repo $WORKSPACE"));
        assert!(dockerfile.contains(
            "RUN apt-get update && apt-get install -y gcc && uv pip install --system -U numpy<2 && uv pip install --system -U \"pytest==8.0\""
        ));
        assert!(!dockerfile.contains("update-ca-certificates"));
    }

    #[test]
    fn dockerfile_installs_certificates_behind_proxy() {
        let proxy = ProxySettings {
            http_proxy: "http://proxy:3128".to_string(),
            https_proxy: "http://proxy:3128".to_string(),
            certificates: vec!["corp.crt".to_string()],
        };
        let dockerfile = render_dockerfile(&spec(), "repo", Some(&proxy)).expect("render");
        assert!(dockerfile.contains("COPY corp.crt /usr/local/share/ca-certificates/"));
        assert!(dockerfile.contains("ENV https_proxy=http://proxy:3128"));
    }

    #[test]
    fn empty_pre_install_defaults_to_true() {
        assert_eq!(pre_install_line(&[]), "true");
        assert_eq!(
            pre_install_line(&["apt-get update".to_string(), "x".to_string()]),
            "apt-get update && x"
        );
    }
}
