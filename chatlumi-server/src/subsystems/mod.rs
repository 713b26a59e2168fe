pub mod conversations;
pub mod facebook_pages;
pub mod webhook;
pub mod workspaces;
