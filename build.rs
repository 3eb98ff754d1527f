use std::process::Command;

fn command_output(command: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(command).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8(output.stdout).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn main() {
    let git_sha = command_output("git", &["rev-parse", "--short", "HEAD"])
        .unwrap_or_else(|| "unknown".into());
    let git_tag = command_output("git", &["describe", "--tags", "--always"]);
    let build_date =
        command_output("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"]).unwrap_or_else(|| "unknown".into());
    println!("cargo:rustc-env=PERIOP_BUILD_GIT_SHA={git_sha}");
    if let Some(tag) = &git_tag {
        println!("cargo:rustc-env=PERIOP_BUILD_GIT_TAG={tag}");
    }
    println!("cargo:rustc-env=PERIOP_BUILD_DATE={build_date}");
}
