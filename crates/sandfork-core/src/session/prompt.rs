//! System prompt template for fork sessions.

/// Stock template. Placeholders are `{name}` and are replaced verbatim.
pub const DEFAULT_SYSTEM_PROMPT: &str = "\
You are an autonomous coding agent working inside an isolated sandbox.

Sandbox: {sandbox_id}
Fork: {fork_num}
Repository: {repo_url}
Branch: {branch}

You may only touch files under these directories of the workspace: {allowed_dirs}.
System directories and credentials are off limits, and dangerous shell
commands are rejected. A rejected call comes back as a SECURITY VIOLATION
result; adjust your approach instead of retrying it.

Use the Bash, Read, Write, Edit, Glob and Grep tools to work on the task.
When you are done, reply with a short summary of what you changed and why,
without calling any tool.

Task:
{task_prompt}
";

/// Values substituted into the template.
#[derive(Debug, Clone)]
pub struct PromptVars<'a> {
    pub sandbox_id: &'a str,
    pub fork_num: u32,
    /// `None` renders as `local`.
    pub repo_url: Option<&'a str>,
    /// `None` renders as `main`.
    pub branch: Option<&'a str>,
    pub task_prompt: &'a str,
    pub allowed_dirs: &'a [String],
}

/// Substitute every known placeholder. Unknown `{...}` text is left alone so
/// templates can contain literal braces.
pub fn render(template: &str, vars: &PromptVars<'_>) -> String {
    let fork_num = vars.fork_num.to_string();
    let allowed = vars.allowed_dirs.join(", ");
    let pairs: [(&str, &str); 6] = [
        ("{sandbox_id}", vars.sandbox_id),
        ("{fork_num}", &fork_num),
        ("{repo_url}", vars.repo_url.unwrap_or("local")),
        ("{branch}", vars.branch.unwrap_or("main")),
        ("{allowed_dirs}", &allowed),
        // Last, so placeholder-like text inside the task is not expanded.
        ("{task_prompt}", vars.task_prompt),
    ];
    pairs
        .iter()
        .fold(template.to_string(), |acc, (key, value)| acc.replace(key, value))
}
