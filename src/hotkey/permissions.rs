//! Keyboard listener permission checks.
//!
//! macOS gates global event taps behind the Accessibility permission; we can
//! only detect the common failure mode up front and hand the user a guidance
//! string. Granting it programmatically is not possible.

/// Whether the global keyboard listener is expected to work.
///
/// On macOS the Quartz event tap silently delivers nothing without the
/// Accessibility permission, and there is no portable query for it, so an
/// operator override is honored: set `CHATTA_KEYBOARD_PERMISSION=0` to force
/// the VAD fallback. Other platforms report `true`.
pub fn check_permission() -> bool {
    match std::env::var("CHATTA_KEYBOARD_PERMISSION") {
        Ok(v) => !matches!(v.trim(), "0" | "false" | "no" | "off"),
        Err(_) => true,
    }
}

/// Human-readable guidance for the platform's permission model.
pub fn permission_guidance() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "Grant Accessibility permission in System Settings → Privacy & Security → Accessibility, then restart the process."
    }
    #[cfg(target_os = "linux")]
    {
        "On Wayland, global key capture may require membership in the `input` group or an X11 session."
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux")))]
    {
        "Global key capture requires no extra permission on this platform."
    }
}
