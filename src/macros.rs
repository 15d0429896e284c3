//! Declarative helpers for the protocol tables.

/// Declares `pub const` error codes and a `get_error_message` lookup.
macro_rules! define_error_codes {
    ($($name:ident = $code:literal => $msg:literal),* $(,)?) => {
        $(pub const $name: u32 = $code;)*

        /// Human readable message for a TinyTuya-style error code.
        pub fn get_error_message(code: u32) -> &'static str {
            match code {
                $($code => $msg,)*
                _ => "Unknown Error",
            }
        }
    };
}

/// Declares the `CommandType` enum with a lossless `u32` mapping.
macro_rules! define_command_type {
    ($($name:ident = $val:literal),* $(,)?) => {
        /// Tuya LAN command codes.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum CommandType {
            $($name = $val,)*
        }

        impl CommandType {
            pub fn from_u32(val: u32) -> Option<Self> {
                match val {
                    $($val => Some(CommandType::$name),)*
                    _ => None,
                }
            }
        }
    };
}

/// Declares the `Version` enum. `Auto` is always present and means "unknown".
macro_rules! define_version {
    ($($name:ident = ($s:literal, $v:literal)),* $(,)?) => {
        /// Tuya LAN protocol version.
        #[derive(Debug, Clone, Copy, PartialEq, Default)]
        pub enum Version {
            #[default]
            Auto,
            $($name,)*
        }

        impl Version {
            pub fn val(&self) -> f32 {
                match self {
                    Version::Auto => 0.0,
                    $(Version::$name => $v,)*
                }
            }

            pub fn as_str(&self) -> &'static str {
                match self {
                    Version::Auto => "Auto",
                    $(Version::$name => $s,)*
                }
            }

            pub fn as_bytes(&self) -> &'static [u8] {
                self.as_str().as_bytes()
            }
        }

        impl std::str::FromStr for Version {
            type Err = $crate::error::TuyaError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                match s.trim() {
                    "" | "Auto" | "auto" => Ok(Version::Auto),
                    $($s => Ok(Version::$name),)*
                    other => Err($crate::error::TuyaError::DecodeError(format!(
                        "unsupported version '{}'",
                        other
                    ))),
                }
            }
        }

        impl From<&str> for Version {
            fn from(s: &str) -> Self {
                s.parse().unwrap_or_default()
            }
        }

        impl From<f32> for Version {
            fn from(v: f32) -> Self {
                $(if (v - $v).abs() < 0.01 {
                    return Version::$name;
                })*
                Version::Auto
            }
        }

        impl std::fmt::Display for Version {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl serde::Serialize for Version {
            fn serialize<S: serde::Serializer>(
                &self,
                serializer: S,
            ) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }
    };
}
