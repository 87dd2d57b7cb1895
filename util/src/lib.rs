//! Operator tooling for the tunnel; see the binaries.
