//! Streaming same-length byte replacement.
//!
//! All replacements keep the stream length unchanged, which is what lets a
//! tar archive be rewritten in flight without touching its size fields.
//! Data is processed in frames; the last `overlap` bytes of each frame are
//! held back and processed again with the next read, so a match spanning a
//! read boundary is never missed.

use std::collections::BTreeSet;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::NormalizeError;

/// Bytes read per frame, not counting the overlap.
const FRAME_SIZE: usize = 32 * 1024;

/// Copy `src` to `dst`, passing every frame through `transform` first.
///
/// `transform` sees the whole unwritten window, including bytes it has
/// already seen, so it must be idempotent on its own output. Any match no
/// longer than `overlap` is guaranteed to lie fully inside one window.
pub async fn copy_with_frames<R, W, F>(
  src: &mut R,
  dst: &mut W,
  overlap: usize,
  mut transform: F,
) -> Result<u64, NormalizeError>
where
  R: AsyncRead + Unpin + ?Sized,
  W: AsyncWrite + Unpin + ?Sized,
  F: FnMut(&mut [u8]) -> Result<(), NormalizeError>,
{
  let mut buf = vec![0u8; FRAME_SIZE + overlap];
  let mut filled = 0;
  let mut written = 0u64;

  loop {
    let n = src
      .read(&mut buf[filled..])
      .await
      .map_err(|e| NormalizeError::io("reading stream", e))?;
    if n == 0 {
      transform(&mut buf[..filled])?;
      dst
        .write_all(&buf[..filled])
        .await
        .map_err(|e| NormalizeError::io("writing stream", e))?;
      written += filled as u64;
      break;
    }
    filled += n;
    transform(&mut buf[..filled])?;

    let keep = overlap.min(filled);
    let emit = filled - keep;
    if emit > 0 {
      dst
        .write_all(&buf[..emit])
        .await
        .map_err(|e| NormalizeError::io("writing stream", e))?;
      written += emit as u64;
      buf.copy_within(emit..filled, 0);
      filled = keep;
    }
  }

  dst
    .flush()
    .await
    .map_err(|e| NormalizeError::io("flushing stream", e))?;
  Ok(written)
}

/// Replace every occurrence of `old` with `new` while copying.
pub async fn replace_bytes<R, W>(src: &mut R, dst: &mut W, old: &[u8], new: &[u8]) -> Result<u64, NormalizeError>
where
  R: AsyncRead + Unpin + ?Sized,
  W: AsyncWrite + Unpin + ?Sized,
{
  check_same_length(old, new)?;
  copy_with_frames(src, dst, old.len(), |frame| in_place_replace_all(frame, old, new)).await
}

/// Replace the `old` prefix of every occurrence of one of `values` with
/// `new`, returning the set of values that matched.
///
/// Every value must start with `old`, and `old` and `new` must be the same
/// length. Occurrences of `old` that don't continue into a value are left
/// alone.
pub async fn replace_strings_prefix<R, W>(
  src: &mut R,
  dst: &mut W,
  values: &[String],
  old: &str,
  new: &str,
) -> Result<BTreeSet<String>, NormalizeError>
where
  R: AsyncRead + Unpin + ?Sized,
  W: AsyncWrite + Unpin + ?Sized,
{
  check_same_length(old.as_bytes(), new.as_bytes())?;
  let overlap = values.iter().map(String::len).max().unwrap_or(0).max(old.len());
  let old = old.as_bytes();
  let new = new.as_bytes();

  let mut matches = BTreeSet::new();
  copy_with_frames(src, dst, overlap, |frame| {
    if old.is_empty() {
      return Ok(());
    }
    let mut start = 0;
    while let Some(i) = find(&frame[start..], old) {
      let at = start + i;
      let rest = &frame[at..];
      if let Some(value) = values.iter().find(|v| rest.starts_with(v.as_bytes())) {
        matches.insert(value.clone());
        frame[at..at + old.len()].copy_from_slice(new);
        start = at + old.len();
      } else {
        start = at + 1;
      }
    }
    Ok(())
  })
  .await?;
  Ok(matches)
}

/// Replace all non-overlapping occurrences of `old` in `s` with `new`.
pub fn in_place_replace_all(s: &mut [u8], old: &[u8], new: &[u8]) -> Result<(), NormalizeError> {
  check_same_length(old, new)?;
  if old.is_empty() {
    return Ok(());
  }
  let mut start = 0;
  while let Some(i) = find(&s[start..], old) {
    let at = start + i;
    s[at..at + old.len()].copy_from_slice(new);
    start = at + old.len();
  }
  Ok(())
}

fn check_same_length(old: &[u8], new: &[u8]) -> Result<(), NormalizeError> {
  if old.len() != new.len() {
    return Err(NormalizeError::NotSameLength {
      old: old.len(),
      new: new.len(),
    });
  }
  Ok(())
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  if needle.len() > haystack.len() {
    return None;
  }
  let first = needle[0];
  let last_start = haystack.len() - needle.len();
  let mut i = 0;
  while i <= last_start {
    match haystack[i..=last_start].iter().position(|&b| b == first) {
      Some(p) => {
        let at = i + p;
        if &haystack[at..at + needle.len()] == needle {
          return Some(at);
        }
        i = at + 1;
      }
      None => return None,
    }
  }
  None
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;
  use std::pin::Pin;
  use std::task::{Context, Poll};
  use tokio::io::ReadBuf;

  /// Yields at most `chunk` bytes per read to exercise frame boundaries.
  struct Trickle {
    data: Vec<u8>,
    pos: usize,
    chunk: usize,
  }

  impl AsyncRead for Trickle {
    fn poll_read(mut self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
      let n = self.chunk.min(self.data.len() - self.pos).min(buf.remaining());
      let start = self.pos;
      buf.put_slice(&self.data[start..start + n]);
      self.pos += n;
      Poll::Ready(Ok(()))
    }
  }

  fn trickle(data: &[u8], chunk: usize) -> Trickle {
    Trickle {
      data: data.to_vec(),
      pos: 0,
      chunk,
    }
  }

  mod in_place {
    use super::*;

    #[test]
    fn replaces_every_occurrence() {
      let mut s = b"foo bar foo".to_vec();
      in_place_replace_all(&mut s, b"foo", b"baz").unwrap();
      assert_eq!(s, b"baz bar baz");
    }

    #[test]
    fn length_mismatch_is_an_error() {
      let mut s = b"foo".to_vec();
      assert!(matches!(
        in_place_replace_all(&mut s, b"foo", b"fo"),
        Err(NormalizeError::NotSameLength { old: 3, new: 2 })
      ));
    }

    #[test]
    fn find_locates_needles() {
      assert_eq!(find(b"abcabd", b"abd"), Some(3));
      assert_eq!(find(b"abc", b"abcd"), None);
      assert_eq!(find(b"aaa", b"b"), None);
    }
  }

  mod streaming {
    use super::*;

    #[tokio::test]
    async fn replace_bytes_across_read_boundaries() {
      let input = b"xxxxhelloxxxxhelloxxxxhel".repeat(50);
      let expected: Vec<u8> = String::from_utf8(input.clone())
        .unwrap()
        .replace("hello", "world")
        .into_bytes();
      for chunk in [1, 2, 3, 4, 5, 7, 64, 100_000] {
        let mut src = trickle(&input, chunk);
        let mut out = Vec::new();
        let n = replace_bytes(&mut src, &mut out, b"hello", b"world").await.unwrap();
        assert_eq!(n as usize, input.len());
        assert_eq!(out, expected, "chunk size {chunk}");
      }
    }

    #[tokio::test]
    async fn replace_bytes_over_frame_boundary() {
      // place a match right across the first frame edge
      let mut input = vec![b'.'; FRAME_SIZE - 2];
      input.extend_from_slice(b"needle");
      input.extend(vec![b'.'; 10]);
      let mut src = Cursor::new(input.clone());
      let mut out = Vec::new();
      replace_bytes(&mut src, &mut out, b"needle", b"\0\0\0\0\0\0").await.unwrap();
      assert_eq!(out.len(), input.len());
      assert_eq!(&out[FRAME_SIZE - 2..FRAME_SIZE + 4], b"\0\0\0\0\0\0");
    }

    #[tokio::test]
    async fn empty_input_produces_empty_output() {
      let mut src = Cursor::new(Vec::new());
      let mut out = Vec::new();
      assert_eq!(replace_bytes(&mut src, &mut out, b"a", b"b").await.unwrap(), 0);
      assert!(out.is_empty());
    }

    #[tokio::test]
    async fn prefix_replacement_records_matches() {
      let store = "/tmp/store";
      let dep_a = format!("{store}/{}", "a".repeat(32));
      let dep_b = format!("{store}/{}", "b".repeat(32));
      let unknown = format!("{store}/{}", "c".repeat(32));
      let input = format!("#!{dep_a}/bin/sh\nexec {unknown}/bin/x\n{dep_a}/lib\n");

      for chunk in [1, 3, 17, 4096] {
        let mut src = trickle(input.as_bytes(), chunk);
        let mut out = Vec::new();
        let matches = replace_strings_prefix(
          &mut src,
          &mut out,
          &[dep_a.clone(), dep_b.clone()],
          store,
          "/xxx/yyyyy",
        )
        .await
        .unwrap();

        assert_eq!(matches.into_iter().collect::<Vec<_>>(), vec![dep_a.clone()]);
        let out = String::from_utf8(out).unwrap();
        assert_eq!(
          out,
          format!(
            "#!/xxx/yyyyy/{}/bin/sh\nexec {unknown}/bin/x\n/xxx/yyyyy/{}/lib\n",
            "a".repeat(32),
            "a".repeat(32)
          ),
          "chunk size {chunk}"
        );
      }
    }

    #[tokio::test]
    async fn prefix_replacement_continues_after_unknown_path() {
      let store = "/s";
      let dep = format!("{store}/{}", "d".repeat(32));
      let input = format!("/s/zzzz {dep}");
      let mut src = Cursor::new(input.into_bytes());
      let mut out = Vec::new();
      let matches = replace_strings_prefix(&mut src, &mut out, &[dep.clone()], store, "/p")
        .await
        .unwrap();
      assert!(matches.contains(&dep));
      assert_eq!(String::from_utf8(out).unwrap(), format!("/s/zzzz /p/{}", "d".repeat(32)));
    }

    #[tokio::test]
    async fn prefix_replacement_requires_same_length() {
      let mut src = Cursor::new(Vec::new());
      let mut out = Vec::new();
      let err = replace_strings_prefix(&mut src, &mut out, &[], "/a", "/bb").await.unwrap_err();
      assert!(matches!(err, NormalizeError::NotSameLength { .. }));
    }
  }
}
