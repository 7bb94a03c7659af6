//! Host CPU architecture detection

use std::fmt;

/// Binary variant selector derived from the host CPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchitectureVariant {
    /// ARM / AArch64 hosts
    Arm,
    /// Everything else (x86_64 and friends)
    Amd,
}

impl ArchitectureVariant {
    /// Resolve a CPU identifier such as `aarch64`, `armv7l` or `x86_64`.
    ///
    /// Any identifier containing `arm` or `aarch64` (in any case) is ARM.
    pub fn resolve(identifier: &str) -> Self {
        let lowered = identifier.to_ascii_lowercase();
        if lowered.contains("arm") || lowered.contains("aarch64") {
            ArchitectureVariant::Arm
        } else {
            ArchitectureVariant::Amd
        }
    }

    /// Resolve the variant for the running host
    pub fn detect() -> Self {
        Self::resolve(std::env::consts::ARCH)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ArchitectureVariant::Arm => "arm",
            ArchitectureVariant::Amd => "amd",
        }
    }
}

impl fmt::Display for ArchitectureVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arm_markers_resolve_to_arm() {
        for id in ["arm", "arm64", "aarch64", "armv7l", "ARM64", "AArch64", "x-ARMhf"] {
            assert_eq!(ArchitectureVariant::resolve(id), ArchitectureVariant::Arm, "{id}");
        }
    }

    #[test]
    fn test_other_identifiers_resolve_to_amd() {
        for id in ["x86_64", "amd64", "i686", "riscv64", "s390x", ""] {
            assert_eq!(ArchitectureVariant::resolve(id), ArchitectureVariant::Amd, "{id}");
        }
    }

    #[test]
    fn test_detect_matches_target() {
        let expected = if cfg!(any(target_arch = "arm", target_arch = "aarch64")) {
            ArchitectureVariant::Arm
        } else {
            ArchitectureVariant::Amd
        };
        assert_eq!(ArchitectureVariant::detect(), expected);
    }

    #[test]
    fn test_display() {
        assert_eq!(ArchitectureVariant::Arm.to_string(), "arm");
        assert_eq!(ArchitectureVariant::Amd.to_string(), "amd");
    }
}
