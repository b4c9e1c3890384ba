//! extended attributes, kept inside the object header
use serde::{Deserialize, Serialize};

use crate::error::{FlashError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattrNamespace {
    Security,
    System,
    Trusted,
    User,
}

/// how `set_xattr` treats an existing attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XattrFlags {
    /// create or replace
    #[default]
    Any,
    /// fail with [FlashError::Exists] if present
    Create,
    /// fail with [FlashError::NoData] if absent
    Replace,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Xattr {
    pub name: String,
    pub value: Vec<u8>,
}

/// a pending change to the attribute list of an object
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XattrMod {
    Set {
        name: String,
        value: Vec<u8>,
        flags: XattrFlags,
    },
    Remove {
        name: String,
    },
}

pub fn parse_xattr_namespace(key: &[u8]) -> Result<XattrNamespace> {
    let namespaces: [(&[u8], XattrNamespace); 4] = [
        (b"user.", XattrNamespace::User),
        (b"system.", XattrNamespace::System),
        (b"trusted.", XattrNamespace::Trusted),
        (b"security.", XattrNamespace::Security),
    ];
    namespaces
        .iter()
        .find(|(prefix, _)| key.len() > prefix.len() && key.starts_with(prefix))
        .map(|(_, namespace)| *namespace)
        .ok_or(FlashError::Unsupported)
}

/// apply `modification` to `xattrs`
pub fn apply_xattr_mod(xattrs: &mut Vec<Xattr>, modification: &XattrMod) -> Result<()> {
    match modification {
        XattrMod::Set { name, value, flags } => {
            parse_xattr_namespace(name.as_bytes())?;
            let existing = xattrs.iter_mut().find(|x| x.name == *name);
            match (existing, flags) {
                (Some(_), XattrFlags::Create) => Err(FlashError::Exists),
                (None, XattrFlags::Replace) => Err(FlashError::NoData),
                (Some(x), _) => {
                    x.value = value.clone();
                    Ok(())
                }
                (None, _) => {
                    xattrs.push(Xattr {
                        name: name.clone(),
                        value: value.clone(),
                    });
                    Ok(())
                }
            }
        }
        XattrMod::Remove { name } => {
            let before = xattrs.len();
            xattrs.retain(|x| x.name != *name);
            if xattrs.len() == before {
                Err(FlashError::NoData)
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn namespaces() {
        assert_eq!(
            parse_xattr_namespace(b"user.mime").unwrap(),
            XattrNamespace::User
        );
        assert_eq!(
            parse_xattr_namespace(b"security.selinux").unwrap(),
            XattrNamespace::Security
        );
        assert!(parse_xattr_namespace(b"user.").is_err());
        assert!(parse_xattr_namespace(b"os2.name").is_err());
    }

    #[test]
    fn create_and_replace_flags() {
        let mut xattrs = Vec::new();
        let set = |flags| XattrMod::Set {
            name: "user.a".into(),
            value: b"1".to_vec(),
            flags,
        };
        assert!(matches!(
            apply_xattr_mod(&mut xattrs, &set(XattrFlags::Replace)),
            Err(FlashError::NoData)
        ));
        apply_xattr_mod(&mut xattrs, &set(XattrFlags::Create)).unwrap();
        assert!(matches!(
            apply_xattr_mod(&mut xattrs, &set(XattrFlags::Create)),
            Err(FlashError::Exists)
        ));
        apply_xattr_mod(&mut xattrs, &set(XattrFlags::Any)).unwrap();
        assert_eq!(xattrs.len(), 1);

        let remove = XattrMod::Remove {
            name: "user.a".into(),
        };
        apply_xattr_mod(&mut xattrs, &remove).unwrap();
        assert!(xattrs.is_empty());
        assert!(apply_xattr_mod(&mut xattrs, &remove).is_err());
    }
}
