//! Line-boundary chunking for messages over the transport limit.

use super::transport::LarkTransport;
use crate::util::char_len;
use anyhow::Context;
use std::time::Duration;

/// Blocks produced by [`compact_paragraphs`] close once they pass this size.
const COMPACT_BLOCK_SOFT_LIMIT: usize = 1000;

/// Split `content` into chunks of at most `max_length` characters.
///
/// Lines are packed greedily and joined with `\n`; a line is never split.
/// A single line longer than `max_length` becomes its own oversized chunk.
/// Joining the returned chunks with `\n` gives back `content`, except for
/// whitespace-only blocks, which are dropped since they cannot be sent.
/// Closed blocks keep their trailing whitespace (blank lines, indentation)
/// rather than being trimmed, so that join is exact.
pub fn chunk_text(content: &str, max_length: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut block = String::new();
    let mut block_len = 0usize;
    let mut block_lines = 0usize;

    for line in content.split('\n') {
        let line_len = char_len(line);
        let candidate = if block_lines == 0 {
            line_len
        } else {
            block_len + 1 + line_len
        };

        if block_lines > 0 && candidate > max_length {
            push_block(&mut chunks, std::mem::take(&mut block));
            block.push_str(line);
            block_len = line_len;
            block_lines = 1;
            continue;
        }

        if block_lines > 0 {
            block.push('\n');
        }
        block.push_str(line);
        block_len = candidate;
        block_lines += 1;
    }

    push_block(&mut chunks, block);
    chunks
}

fn push_block(chunks: &mut Vec<String>, block: String) {
    if !block.trim().is_empty() {
        chunks.push(block);
    }
}

/// Prefix each chunk with `[i/N] ` when there is more than one.
pub fn label_chunks(chunks: &[String]) -> Vec<String> {
    let total = chunks.len();
    if total <= 1 {
        return chunks.to_vec();
    }
    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| format!("[{}/{total}] {chunk}", i + 1))
        .collect()
}

/// Send `content` as labelled chunks, one at a time, pausing `delay`
/// between sends. Stops at the first failed send. Returns the chunk count.
pub async fn send_in_chunks(
    transport: &dyn LarkTransport,
    chat_id: &str,
    content: &str,
    max_length: usize,
    delay: Duration,
) -> anyhow::Result<usize> {
    let chunks = label_chunks(&chunk_text(content, max_length));
    let total = chunks.len();
    tracing::info!(
        chat_id,
        length = char_len(content),
        chunk_count = total,
        "Splitting long message into chunks"
    );

    for (index, chunk) in chunks.iter().enumerate() {
        transport
            .send_text(chat_id, chunk)
            .await
            .with_context(|| format!("chunk {}/{total} to {chat_id}", index + 1))?;

        if index + 1 < total && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    tracing::info!(chat_id, chunk_count = total, "Sent message in chunks");
    Ok(total)
}

/// Tidy a document body: blank lines end a block, non-blank lines are
/// trimmed and merged into the current block until it passes 1000 chars.
/// Blocks are separated by one blank line.
pub fn compact_paragraphs(content: &str) -> String {
    let mut blocks: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if char_len(&current) > COMPACT_BLOCK_SOFT_LIMIT {
            blocks.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(trimmed);
    }
    if !current.is_empty() {
        blocks.push(current);
    }

    blocks.join("\n\n")
}
