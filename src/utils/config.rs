//! Configuration parameters struct parsing helper.

/// Composes a configuration struct from its default values, then overwrites
/// given fields by parsing from given TOML string if it's not `None`. Returns
/// an `Ok(config)` on success, and `Err(MemRepError)` on parser failure.
///
/// Example:
/// ```ignore
/// let config = parsed_config!(config_str => MyConfig; num_replicas)?;
/// ```
#[macro_export]
macro_rules! parsed_config {
    ($config_str:expr => $config_type:ty; $($field:ident),+) => {{
        let config_str: Option<&str> = $config_str;

        // closure helper for easier error returning
        let compose_config = || -> Result<$config_type, MemRepError> {
            let mut config: $config_type = Default::default();
            if config_str.is_none() {
                return Ok(config);
            }

            let mut table = config_str.unwrap().parse::<toml::Table>()?;

            // traverse through all given field names
            $({
                // if field name found in table (and removed)
                if let Some(v) = table.remove(stringify!($field)) {
                    config.$field = v.try_into()?;
                }
            })+

            // if table is not empty at this time, some parsed keys are not
            // expected hence invalid
            if !table.is_empty() {
                return Err(MemRepError(format!(
                    "invalid field name '{}' in config",
                    table.keys().next().unwrap(),
                )));
            }

            Ok(config)
        };

        compose_config()
    }};
}

#[cfg(test)]
mod config_tests {
    use crate::utils::MemRepError;

    #[derive(Debug, PartialEq)]
    struct TestConfig {
        num_replicas: u32,
        locator: String,
        read_ratio: f64,
    }

    impl Default for TestConfig {
        fn default() -> Self {
            TestConfig {
                num_replicas: 3,
                locator: "tcp:host=backup1".into(),
                read_ratio: 0.5,
            }
        }
    }

    #[test]
    fn parse_from_none() -> Result<(), MemRepError> {
        let config =
            parsed_config!(None => TestConfig; num_replicas, locator)?;
        let ref_config: TestConfig = Default::default();
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_from_partial() -> Result<(), MemRepError> {
        let config_str = Some("num_replicas = 2");
        let config =
            parsed_config!(config_str => TestConfig; num_replicas, read_ratio)?;
        let ref_config = TestConfig {
            num_replicas: 2,
            locator: "tcp:host=backup1".into(),
            read_ratio: 0.5,
        };
        assert_eq!(config, ref_config);
        Ok(())
    }

    #[test]
    fn parse_invalid_field() {
        let config_str = Some("twiddle = 999");
        assert!(parsed_config!(config_str => TestConfig; num_replicas).is_err());
    }
}
