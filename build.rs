fn tag_from_git() -> Option<String> {
    let output = std::process::Command::new("git")
        .args([
            "-c",
            "core.abbrev=8",
            "show",
            "-s",
            "--format=%cd-%h",
            "--date=format:%Y.%m.%d",
        ])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

fn ci_tag() -> String {
    if let Ok(env) = std::env::var("CASA_CI_TAG") {
        return env.trim().to_string();
    }
    if let Ok(tag) = std::fs::read_to_string(".tag") {
        return tag.trim().to_string();
    }
    tag_from_git().unwrap_or_default()
}

fn main() {
    println!("cargo:rerun-if-changed=.tag");
    println!("cargo:rerun-if-env-changed=CASA_CI_TAG");
    println!("cargo:rustc-env=CASA_CI_TAG={}", ci_tag());
}
