//! Component invoker: `(component, props)` → HTML.
//!
//! The jsx factory builds the element inside the sandbox, the harness
//! resolves it down to host nodes, and a [`TreeSerializer`] writes the HTML.
//! A [`Component`] can only be obtained from [`Sandbox::execute`], which
//! already checked that it is callable.

use crate::sandbox::{Component, Fault, Sandbox, Termination};
use crate::serializer::{parse_events, SerializeError, TreeSerializer};
use serde_json::Value;
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("{message}")]
    Threw { message: String },

    #[error(transparent)]
    Serialize(#[from] SerializeError),

    #[error("Rendering timed out")]
    TimedOut,

    #[error("Rendering exceeded the heap limit")]
    HeapLimit,

    #[error("Rendering was cancelled")]
    Cancelled,

    #[error("Renderer fault: {0}")]
    Harness(String),
}

impl From<Fault> for RenderError {
    fn from(fault: Fault) -> Self {
        match fault {
            Fault::Threw { message, .. } => RenderError::Threw { message },
            Fault::Terminated(Some(Termination::Timeout)) => RenderError::TimedOut,
            Fault::Terminated(Some(Termination::HeapLimit)) => RenderError::HeapLimit,
            Fault::Terminated(_) => RenderError::Cancelled,
            Fault::Harness(message) => RenderError::Harness(message),
        }
    }
}

/// Drives a component through the jsx factory and a tree serializer.
pub struct Invoker<'a> {
    serializer: &'a dyn TreeSerializer,
}

impl<'a> Invoker<'a> {
    pub fn new(serializer: &'a dyn TreeSerializer) -> Self {
        Self { serializer }
    }

    /// Build `create(component, props)` and serialize it. Nothing partial is
    /// returned: either the whole document or an error.
    pub fn invoke(&self, sandbox: &mut Sandbox, component: &Component, props: &Value) -> Result<String, RenderError> {
        let props_json = serde_json::to_string(props).map_err(|e| RenderError::Harness(e.to_string()))?;

        let element = sandbox.create_element(component, &props_json)?;
        let events = sandbox.resolve(&element)?;
        trace!(bytes = events.len(), "resolved element tree");

        let nodes = parse_events(&events)?;
        Ok(self.serializer.serialize(&nodes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompiledModule;
    use crate::import_map::ModuleId;
    use crate::sandbox::SandboxConfig;
    use crate::serializer::HtmlSerializer;
    use serde_json::json;

    fn render(code: &str, props: Value) -> Result<String, RenderError> {
        let mut sandbox = Sandbox::new(&SandboxConfig::default()).unwrap();
        let module = CompiledModule::new(code.to_string(), vec![ModuleId::Entry]);
        let component = sandbox.execute(&module).unwrap();
        Invoker::new(&HtmlSerializer).invoke(&mut sandbox, &component, &props)
    }

    const TEST_COMPONENT: &str = r#"
        const { jsx, jsxs } = require("react/jsx-runtime");
        module.exports = { default: function Test({ title, content }) {
            return jsxs("div", { children: [
                title && jsx("h2", { children: title }),
                jsx("div", { children: content }),
            ] });
        } };
    "#;

    #[test]
    fn test_function_component() {
        let html = render(TEST_COMPONENT, json!({"title": "Test Title", "content": "Test Content"})).unwrap();
        assert_eq!(html, "<div><h2>Test Title</h2><div>Test Content</div></div>");
    }

    #[test]
    fn test_falsy_branch_is_omitted() {
        let html = render(TEST_COMPONENT, json!({"title": "", "content": "Body"})).unwrap();
        assert_eq!(html, "<div><div>Body</div></div>");
    }

    #[test]
    fn test_class_component_and_fragment() {
        let code = r#"
            const React = require("react");
            class Greeting extends React.Component {
                render() {
                    return React.createElement(React.Fragment, null,
                        React.createElement("span", { className: "hi" }, "Hello, ", this.props.name));
                }
            }
            module.exports = { default: (props) => React.createElement(Greeting, props) };
        "#;
        let html = render(code, json!({"name": "Ada"})).unwrap();
        assert_eq!(html, r#"<span class="hi">Hello, <!-- -->Ada</span>"#);
    }

    #[test]
    fn test_context_and_hooks() {
        let code = r#"
            const React = require("react");
            const Theme = React.createContext("light");
            function Label() {
                const theme = React.useContext(Theme);
                const [count] = React.useState(3);
                return React.createElement("b", null, theme + ":" + count);
            }
            module.exports = { default: () =>
                React.createElement(Theme.Provider, { value: "dark" }, React.createElement(Label)) };
        "#;
        assert_eq!(render(code, json!({})).unwrap(), "<b>dark:3</b>");
    }

    #[test]
    fn test_component_throw_is_render_error() {
        let code = r#"module.exports = { default: () => { throw new Error("render failed"); } };"#;
        match render(code, json!({})) {
            Err(RenderError::Threw { message }) => assert_eq!(message, "Error: render failed"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_invalid_tag_is_serialize_error() {
        let code = r#"
            const { jsx } = require("react/jsx-runtime");
            module.exports = { default: () => jsx("bad tag", {}) };
        "#;
        assert!(matches!(
            render(code, json!({})),
            Err(RenderError::Serialize(SerializeError::InvalidTagName(_)))
        ));
    }
}
