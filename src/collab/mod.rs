//! Default collaborators wired by the daemon: ClamAV scanning, zip packing,
//! WebDAV upload and share links, sendmail notification, desktop alerts.

pub mod archive;
pub mod clamav;
pub mod mail;
pub mod webdav;
