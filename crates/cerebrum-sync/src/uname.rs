//! Username policy.
//!
//! A username is three lowercase ASCII letters taken from the person's first
//! and last name followed by three digits, e.g. `kar001`. The first free
//! number wins. SITO accounts carry a postfix (`kar001-s`) so they never
//! collide with university accounts. Numbers ending in `999` are reserved for
//! administrative accounts.

use cerebrum_core::store::IdentityStore;

use crate::{Error, Result};

fn fold(c: char) -> &'static str {
  match c {
    'æ' | 'Æ' => "ae",
    'ø' | 'Ø' | 'ö' | 'Ö' | 'ó' | 'ò' => "o",
    'å' | 'Å' => "aa",
    'ä' | 'Ä' | 'á' | 'à' | 'â' => "a",
    'é' | 'è' | 'ê' | 'ë' | 'É' => "e",
    'ü' | 'Ü' | 'ú' => "u",
    'í' | 'ì' | 'ï' => "i",
    'ñ' => "n",
    'ç' => "c",
    _ => "",
  }
}

/// Replace the Norwegian and common western European letters with ASCII and
/// drop anything else that is not ASCII.
pub fn transliterate(s: &str) -> String {
  let mut out = String::with_capacity(s.len());
  for c in s.chars() {
    if c.is_ascii() {
      out.push(c);
    } else {
      out.push_str(fold(c));
    }
  }
  out
}

/// GECOS field for a posix account.
pub fn gecos(first: &str, last: &str) -> String {
  transliterate(&format!("{} {}", first.trim(), last.trim())).trim().to_owned()
}

/// The three letter stem of every username suggested for this name.
pub fn prefix(first: &str, last: &str) -> String {
  let mut letters: String = transliterate(&format!("{first}{last}"))
    .chars()
    .filter(char::is_ascii_alphabetic)
    .map(|c| c.to_ascii_lowercase())
    .take(3)
    .collect();
  while letters.len() < 3 {
    letters.push('x');
  }
  letters
}

/// Every name the policy allows for `prefix`, in order of preference.
pub fn candidates<'a>(prefix: &'a str, postfix: &'a str) -> impl Iterator<Item = String> + 'a {
  (1..999).map(move |n| format!("{prefix}{n:03}{postfix}"))
}

/// The first candidate not taken in the store.
pub async fn suggest_uname<S: IdentityStore>(
  store: &S,
  first: &str,
  last: &str,
  postfix: &str,
) -> Result<String> {
  let stem = prefix(first, last);
  for name in candidates(&stem, postfix) {
    if store.find_account_by_name(&name).await.map_err(Error::store)?.is_none() {
      return Ok(name);
    }
  }
  Err(Error::NoFreeUsername(stem))
}
