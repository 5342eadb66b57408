//! Sender address normalization and identity

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identity of a sender, derived from the normalized address
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SenderIdentity {
    pub sender_id: String,
    pub email: String,
    pub domain: String,
}

impl SenderIdentity {
    /// Build an identity from a raw `From` value or bare address.
    /// Returns `None` when no usable address can be found.
    pub fn parse(raw: &str) -> Option<Self> {
        let address = extract_address(raw)?;
        let email = normalize_email(&address);
        let domain = email.split_once('@').map(|(_, d)| d.to_string())?;
        if domain.is_empty() {
            return None;
        }
        Some(Self {
            sender_id: sender_id(&email),
            email,
            domain,
        })
    }
}

/// Pull the mailbox out of a header value such as `"Jane Doe" <jane@x.org>`.
pub fn extract_address(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Ok(list) = mailparse::addrparse(raw) {
        let first = list.iter().find_map(|addr| match addr {
            mailparse::MailAddr::Single(info) => Some(info.addr.clone()),
            mailparse::MailAddr::Group(group) => group.addrs.first().map(|i| i.addr.clone()),
        });
        if let Some(addr) = first.filter(|a| a.contains('@')) {
            return Some(addr);
        }
    }

    // Malformed headers: fall back to the bracketed part or the bare value
    if let (Some(start), Some(end)) = (raw.rfind('<'), raw.rfind('>')) {
        if start < end {
            let inner = raw[start + 1..end].trim();
            if inner.contains('@') {
                return Some(inner.to_string());
            }
        }
    }
    if raw.contains('@') && !raw.contains(char::is_whitespace) {
        return Some(raw.to_string());
    }
    None
}

pub fn normalize_email(email: &str) -> String {
    let email = email.trim().to_lowercase();

    let Some((local, domain)) = email.split_once('@') else {
        return email;
    };

    // Strip +tag subaddressing (Gmail, Outlook, Fastmail, etc.)
    let local = match local.split_once('+') {
        Some((base, _)) => base,
        None => local,
    };

    // Strip dots from local part for Gmail/Googlemail
    let local = if domain == "gmail.com" || domain == "googlemail.com" {
        local.replace('.', "")
    } else {
        local.to_string()
    };

    format!("{}@{}", local, domain)
}

/// SHA-256 of the normalized address, hex encoded
pub fn sender_id(normalized_email: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_email.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_normalization() {
        assert_eq!(normalize_email("Brian@Gmail.com"), "brian@gmail.com");
    }

    #[test]
    fn test_strip_subaddress() {
        assert_eq!(normalize_email("brian+spam@gmail.com"), "brian@gmail.com");
    }

    #[test]
    fn test_dots_preserved_non_gmail() {
        assert_eq!(normalize_email("b.rian@outlook.com"), "b.rian@outlook.com");
    }

    #[test]
    fn test_extract_from_display_name() {
        assert_eq!(
            extract_address("\"Jane Doe\" <Jane.Doe@Example.com>").as_deref(),
            Some("Jane.Doe@Example.com")
        );
        assert_eq!(
            extract_address("news@substack.com").as_deref(),
            Some("news@substack.com")
        );
    }

    #[test]
    fn test_extract_rejects_garbage() {
        assert_eq!(extract_address(""), None);
        assert_eq!(extract_address("   "), None);
        assert_eq!(extract_address("Undisclosed recipients"), None);
    }

    #[test]
    fn test_identity_is_stable_across_spellings() {
        let a = SenderIdentity::parse("Boss <B.O.S.S+work@gmail.com>").unwrap();
        let b = SenderIdentity::parse("boss@GMAIL.com").unwrap();
        assert_eq!(a.sender_id, b.sender_id);
        assert_eq!(a.email, "boss@gmail.com");
        assert_eq!(a.domain, "gmail.com");
        assert_eq!(a.sender_id.len(), 64);
    }

    #[test]
    fn test_different_senders_differ() {
        let a = SenderIdentity::parse("alice@company.com").unwrap();
        let b = SenderIdentity::parse("bob@company.com").unwrap();
        assert_ne!(a.sender_id, b.sender_id);
    }
}
