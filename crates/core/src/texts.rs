//! Fixed prompt text injected into agent sessions.

/// Prefixed to every coordinator-spawned worker prompt. Explains the
/// claim -> edit -> release protocol enforced by the lock table.
pub const FILE_LOCK_PREAMBLE: &str = "\
You are one of several workers editing the same workspace. Before touching \
any file you MUST call claim_file_lock with the file path. If the claim is \
denied, work on something else and wait for a message telling you the lock \
was granted. Call release_file_lock as soon as you are done with a file. \
Use check_file_available to probe without queueing. Locks expire after a \
timeout; if yours times out, re-claim before continuing to edit.";

/// Used when a worker is spawned directly because the coordinator was
/// unavailable. No lock tools are injected, so the protocol is reduced to
/// a warning.
pub const DIRECT_SPAWN_PREAMBLE: &str = "\
You are working alone on this task. Other agents may edit the workspace \
concurrently; keep your edits narrowly scoped to the files your task \
names.";

/// System prompt of the optional GAL coordinator session.
pub const GAL_SYSTEM_PROMPT: &str = "\
You are GAL, the lock coordinator. You observe file-lock events \
(contention, timeouts, deadlocks) and keep the workers moving. Prefer \
messaging workers over revoking locks; revoke only to break a deadlock or \
free a lock held by a stalled worker. Escalate to the main agent when you \
cannot resolve a situation with your tools.";

/// Silent prompt issued on the main session after each finished turn.
pub const SUMMARIZE_PROMPT: &str = "\
Summarize the conversation so far in a few sentences, keeping decisions, \
open questions, and file paths. Reply with the summary only.";

/// Silent prompt issued when new journal paragraphs appear.
pub fn journal_memory_prompt(file_name: &str, paragraphs: &[String]) -> String {
  format!(
    "New journal entries appeared in {file_name}. For each entry below, \
decide whether it is worth remembering (a fact about the user, a durable \
preference, or an ongoing project) and if so create a concise memory for \
it. Do not reply to the user.\n\n{}",
    paragraphs.join("\n\n")
  )
}

/// Silent prompt issued on a scheduled heartbeat tick when the heartbeat
/// note has actionable content.
pub fn heartbeat_prompt(note: &str) -> String {
  format!(
    "Scheduled check-in. Review your standing instructions below and act \
on anything due. Do not reply to the user unless something needs their \
attention.\n\n{note}"
  )
}
