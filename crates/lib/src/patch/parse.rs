//! Unified diff parsing.

use super::PatchFailure;

/// One line of a hunk body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
  Context(String),
  Remove(String),
  Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
  pub old_start: usize,
  pub old_len: usize,
  pub new_start: usize,
  pub new_len: usize,
  pub lines: Vec<HunkLine>,
  /// The old side's last line has no trailing newline.
  pub old_no_newline: bool,
  /// The new side's last line has no trailing newline.
  pub new_no_newline: bool,
}

impl Hunk {
  /// Lines the hunk expects to find (context and removals).
  pub fn old_lines(&self) -> Vec<&str> {
    self
      .lines
      .iter()
      .filter_map(|l| match l {
        HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
        HunkLine::Add(_) => None,
      })
      .collect()
  }

  /// Lines the hunk leaves behind (context and additions).
  pub fn new_lines(&self) -> Vec<&str> {
    self
      .lines
      .iter()
      .filter_map(|l| match l {
        HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
        HunkLine::Remove(_) => None,
      })
      .collect()
  }
}

/// The changes to one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
  /// `None` for `/dev/null` (file creation).
  pub old_path: Option<String>,
  /// `None` for `/dev/null` (file deletion).
  pub new_path: Option<String>,
  pub hunks: Vec<Hunk>,
}

/// Parse the file patches of a unified diff. Leading commentary and git
/// extended headers are ignored.
pub fn parse(text: &str) -> Result<Vec<FilePatch>, PatchFailure> {
  let lines: Vec<&str> = text.lines().collect();
  let mut files = Vec::new();
  let mut i = 0;

  while i < lines.len() {
    let Some(old) = lines[i].strip_prefix("--- ") else {
      i += 1;
      continue;
    };
    let Some(new) = lines.get(i + 1).and_then(|l| l.strip_prefix("+++ ")) else {
      return Err(PatchFailure::Malformed {
        line: i + 2,
        message: "expected '+++' after '---'".to_string(),
      });
    };
    i += 2;

    let mut hunks = Vec::new();
    while i < lines.len() && lines[i].starts_with("@@") {
      let (hunk, next) = parse_hunk(&lines, i)?;
      hunks.push(hunk);
      i = next;
    }

    if hunks.is_empty() {
      return Err(PatchFailure::Malformed {
        line: i + 1,
        message: "file header without hunks".to_string(),
      });
    }

    files.push(FilePatch {
      old_path: header_path(old),
      new_path: header_path(new),
      hunks,
    });
  }

  if files.is_empty() {
    return Err(PatchFailure::Empty);
  }
  Ok(files)
}

fn header_path(raw: &str) -> Option<String> {
  let path = raw.split('\t').next().unwrap_or(raw).trim_end();
  if path == "/dev/null" {
    None
  } else {
    Some(path.to_string())
  }
}

/// Parse `-a,b +c,d` from an `@@` line.
fn parse_range(spec: &str, line: usize) -> Result<(usize, usize), PatchFailure> {
  let malformed = || PatchFailure::Malformed {
    line,
    message: format!("bad hunk range '{}'", spec),
  };
  let (start, len) = match spec.split_once(',') {
    Some((s, l)) => (s, l),
    None => (spec, "1"),
  };
  let start = start.parse().map_err(|_| malformed())?;
  let len = len.parse().map_err(|_| malformed())?;
  Ok((start, len))
}

fn parse_hunk(lines: &[&str], at: usize) -> Result<(Hunk, usize), PatchFailure> {
  let header = lines[at];
  let line_no = at + 1;
  let malformed = |message: &str| PatchFailure::Malformed {
    line: line_no,
    message: message.to_string(),
  };

  let inner = header
    .strip_prefix("@@ ")
    .and_then(|rest| rest.split(" @@").next())
    .ok_or_else(|| malformed("bad hunk header"))?;
  let mut parts = inner.split_whitespace();
  let old = parts
    .next()
    .and_then(|p| p.strip_prefix('-'))
    .ok_or_else(|| malformed("missing old range"))?;
  let new = parts
    .next()
    .and_then(|p| p.strip_prefix('+'))
    .ok_or_else(|| malformed("missing new range"))?;
  let (old_start, old_len) = parse_range(old, line_no)?;
  let (new_start, new_len) = parse_range(new, line_no)?;

  let mut hunk = Hunk {
    old_start,
    old_len,
    new_start,
    new_len,
    lines: Vec::new(),
    old_no_newline: false,
    new_no_newline: false,
  };

  let (mut old_seen, mut new_seen) = (0, 0);
  let mut i = at + 1;
  while old_seen < old_len || new_seen < new_len {
    let Some(line) = lines.get(i) else {
      return Err(PatchFailure::Malformed {
        line: i + 1,
        message: "hunk ends early".to_string(),
      });
    };
    match line.chars().next() {
      Some(' ') => {
        hunk.lines.push(HunkLine::Context(line[1..].to_string()));
        old_seen += 1;
        new_seen += 1;
      }
      // blank context line with its leading space trimmed
      None => {
        hunk.lines.push(HunkLine::Context(String::new()));
        old_seen += 1;
        new_seen += 1;
      }
      Some('-') => {
        hunk.lines.push(HunkLine::Remove(line[1..].to_string()));
        old_seen += 1;
      }
      Some('+') => {
        hunk.lines.push(HunkLine::Add(line[1..].to_string()));
        new_seen += 1;
      }
      Some('\\') => mark_no_newline(&mut hunk),
      Some(_) => {
        return Err(PatchFailure::Malformed {
          line: i + 1,
          message: format!("unexpected line in hunk: '{}'", line),
        });
      }
    }
    i += 1;
  }

  if old_seen != old_len || new_seen != new_len {
    return Err(malformed("hunk line counts do not match its header"));
  }

  // trailing "\ No newline at end of file" marker(s)
  while let Some(line) = lines.get(i)
    && line.starts_with('\\')
  {
    mark_no_newline(&mut hunk);
    i += 1;
  }

  Ok((hunk, i))
}

fn mark_no_newline(hunk: &mut Hunk) {
  match hunk.lines.last() {
    Some(HunkLine::Remove(_)) => hunk.old_no_newline = true,
    Some(HunkLine::Add(_)) => hunk.new_no_newline = true,
    Some(HunkLine::Context(_)) => {
      hunk.old_no_newline = true;
      hunk.new_no_newline = true;
    }
    None => {}
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const DIFF: &str = "\
diff --git a/src/foo.c b/src/foo.c
index 1111111..2222222 100644
--- a/src/foo.c\t2014-01-01 00:00:00
+++ b/src/foo.c\t2014-01-02 00:00:00
@@ -1,3 +1,3 @@
 #include <stdio.h>
-int A(void);
+int B(void);
 int main(void);
@@ -10 +10,2 @@ static int x;
 return 0;
+/* done */
--- /dev/null
+++ b/NEWS
@@ -0,0 +1 @@
+first
\\ No newline at end of file
";

  #[test]
  fn parses_files_and_hunks() {
    let files = parse(DIFF).unwrap();
    assert_eq!(files.len(), 2);

    let foo = &files[0];
    assert_eq!(foo.old_path.as_deref(), Some("a/src/foo.c"));
    assert_eq!(foo.new_path.as_deref(), Some("b/src/foo.c"));
    assert_eq!(foo.hunks.len(), 2);
    assert_eq!(foo.hunks[0].old_lines(), vec!["#include <stdio.h>", "int A(void);", "int main(void);"]);
    assert_eq!(foo.hunks[0].new_lines(), vec!["#include <stdio.h>", "int B(void);", "int main(void);"]);
    assert_eq!((foo.hunks[1].old_start, foo.hunks[1].old_len), (10, 1));

    let news = &files[1];
    assert_eq!(news.old_path, None);
    assert!(news.hunks[0].new_no_newline);
  }

  #[test]
  fn rejects_truncated_hunks() {
    let diff = "--- a/x\n+++ b/x\n@@ -1,3 +1,3 @@\n a\n-b\n";
    assert!(matches!(parse(diff), Err(PatchFailure::Malformed { .. })));
  }

  #[test]
  fn rejects_text_without_patches() {
    assert!(matches!(parse("just some words\n"), Err(PatchFailure::Empty)));
  }
}
