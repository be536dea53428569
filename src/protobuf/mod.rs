//! Generated protobuf modules
//!
//! build.rs compiles every `.proto` under `protos/` (or `MESHTASTIC_PROTO_DIR`);
//! prost emits one file per package, so everything lands in `meshtastic.rs`.

pub mod meshtastic_generated {
    //! Generated Meshtastic protobuf types.
    //! Wrapped in a submodule with broad allow() attributes so unused parts of the
    //! schema do not produce dead_code noise.
    #[allow(dead_code, unused_imports, unused_variables, unused_mut, unused_macros)]
    #[allow(clippy::all)]
    #[allow(rustdoc::invalid_html_tags)]
    mod inner {
        include!(concat!(env!("OUT_DIR"), "/meshtastic.rs"));
    }
    pub use inner::*;
}
