use std::collections::HashMap;

/// Looks up builder metadata kept outside the database
pub trait BuilderResolver: Send + Sync {
    /// Display name of `builder_name`, if one is configured
    fn friendly_name(&self, builder_name: &str) -> Option<String>;

    /// Project `builder_name` belongs to
    fn project(&self, builder_name: &str) -> Option<String>;

    /// Display name, falling back to the builder name itself
    fn display_name(&self, builder_name: &str) -> String {
        self.friendly_name(builder_name)
            .unwrap_or_else(|| builder_name.to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct BuilderInfo {
    friendly_name: Option<String>,
    project: Option<String>,
}

/// Resolver backed by a fixed table
#[derive(Debug, Clone, Default)]
pub struct StaticBuilderResolver {
    builders: HashMap<String, BuilderInfo>,
}

impl StaticBuilderResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builder(
        mut self,
        builder_name: impl Into<String>,
        friendly_name: Option<&str>,
        project: Option<&str>,
    ) -> Self {
        self.builders.insert(
            builder_name.into(),
            BuilderInfo {
                friendly_name: friendly_name.map(str::to_string),
                project: project.map(str::to_string),
            },
        );
        self
    }
}

impl BuilderResolver for StaticBuilderResolver {
    fn friendly_name(&self, builder_name: &str) -> Option<String> {
        self.builders
            .get(builder_name)
            .and_then(|info| info.friendly_name.clone())
    }

    fn project(&self, builder_name: &str) -> Option<String> {
        self.builders
            .get(builder_name)
            .and_then(|info| info.project.clone())
    }
}
