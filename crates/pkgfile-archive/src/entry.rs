//! Package identity from cache entry names.

/// A package name and version borrowed from an archive entry name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageRef<'a> {
    pub name: &'a str,
    pub version: &'a str,
}

#[derive(Debug, thiserror::Error)]
#[error("malformed package entry name: {0}")]
pub struct BadEntryName(pub String);

/// Splits `NAME-VERSION-REL` into `NAME` and `VERSION-REL`.
///
/// The second-from-right `-` is the separator; package names may themselves
/// contain dashes. Fails when fewer than two dashes are present.
pub fn parse_pkgname(entry_name: &str) -> Result<PackageRef<'_>, BadEntryName> {
    let rel = entry_name
        .rfind('-')
        .ok_or_else(|| BadEntryName(entry_name.to_owned()))?;
    let ver = entry_name[..rel]
        .rfind('-')
        .ok_or_else(|| BadEntryName(entry_name.to_owned()))?;

    Ok(PackageRef {
        name: &entry_name[..ver],
        version: &entry_name[ver + 1..],
    })
}
