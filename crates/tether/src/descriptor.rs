//! Service descriptors: the shared contract between a client and a server.
//!
//! A descriptor names a service and declares the call shape of each method.
//! Both ends construct the same descriptor (usually from one shared
//! function), and the typed layer enforces the declared shapes on both
//! sides.

use std::collections::HashMap;

use tether_core::CallShape;

/// Declares a service's name and the shape of each of its methods.
#[derive(Debug, Clone)]
pub struct ServiceDescriptor {
    name: &'static str,
    methods: HashMap<&'static str, CallShape>,
}

impl ServiceDescriptor {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            methods: HashMap::new(),
        }
    }

    pub fn unary(self, method: &'static str) -> Self {
        self.method(method, CallShape::Unary)
    }

    pub fn streaming(self, method: &'static str) -> Self {
        self.method(method, CallShape::Streaming)
    }

    pub fn oneway(self, method: &'static str) -> Self {
        self.method(method, CallShape::Oneway)
    }

    pub fn method(mut self, method: &'static str, shape: CallShape) -> Self {
        let prev = self.methods.insert(method, shape);
        assert!(
            prev.is_none(),
            "method {method} declared twice on service {}",
            self.name
        );
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// The declared shape, or `None` for a method this descriptor does not
    /// know about.
    pub fn shape(&self, method: &str) -> Option<CallShape> {
        self.methods.get(method).copied()
    }

    /// Wire-level method key: `"Service.method"`.
    pub fn full_name(&self, method: &str) -> String {
        format!("{}.{method}", self.name)
    }

    pub fn methods(&self) -> impl Iterator<Item = (&'static str, CallShape)> + '_ {
        self.methods.iter().map(|(m, s)| (*m, *s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn calculator() -> ServiceDescriptor {
        ServiceDescriptor::new("Calculator")
            .unary("add")
            .streaming("countUp")
            .oneway("reset")
    }

    #[test]
    fn shapes_are_recorded() {
        let desc = calculator();
        assert_eq!(desc.shape("add"), Some(CallShape::Unary));
        assert_eq!(desc.shape("countUp"), Some(CallShape::Streaming));
        assert_eq!(desc.shape("reset"), Some(CallShape::Oneway));
        assert_eq!(desc.shape("divide"), None);
    }

    #[test]
    fn full_name_joins_service_and_method() {
        assert_eq!(calculator().full_name("add"), "Calculator.add");
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn duplicate_method_panics() {
        let _ = ServiceDescriptor::new("Calculator").unary("add").oneway("add");
    }
}
