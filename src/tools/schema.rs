/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParamKind {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Object,
}

impl ParamKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            ParamKind::String => value.is_string(),
            ParamKind::Integer => value.is_i64() || value.is_u64(),
            // Integers are acceptable where floats are expected.
            ParamKind::Float => value.is_number(),
            ParamKind::Boolean => value.is_boolean(),
            ParamKind::Array => value.is_array(),
            ParamKind::Object => value.is_object(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one_of: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            name: name.into(),
            kind,
            required: true,
            one_of: None,
            min: None,
            max: None,
        }
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self {
            required: false,
            ..Self::required(name, kind)
        }
    }

    pub fn one_of(mut self, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.one_of = Some(values.into_iter().map(Into::into).collect());
        self
    }

    pub fn min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub params: Vec<ParamSpec>,
}

impl ToolSpec {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            params: Vec::new(),
        }
    }

    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDiagnostic {
    pub field: String,
    pub problem: String,
}

/// Pure validation of `args` against a tool's parameter schema. An empty
/// result means the arguments are acceptable.
pub fn validate(spec: &ToolSpec, args: &Value) -> Vec<FieldDiagnostic> {
    let mut diagnostics = Vec::new();

    let map = match args {
        Value::Object(map) => map,
        Value::Null => {
            for param in spec.params.iter().filter(|p| p.required) {
                diagnostics.push(FieldDiagnostic {
                    field: param.name.clone(),
                    problem: "required field is missing".to_owned(),
                });
            }
            return diagnostics;
        }
        other => {
            diagnostics.push(FieldDiagnostic {
                field: "<args>".to_owned(),
                problem: format!("expected an object, got {}", json_type_name(other)),
            });
            return diagnostics;
        }
    };

    for param in &spec.params {
        let Some(value) = map.get(&param.name) else {
            if param.required {
                diagnostics.push(FieldDiagnostic {
                    field: param.name.clone(),
                    problem: "required field is missing".to_owned(),
                });
            }
            continue;
        };

        if !param.kind.accepts(value) {
            diagnostics.push(FieldDiagnostic {
                field: param.name.clone(),
                problem: format!(
                    "expected {:?}, got {}",
                    param.kind,
                    json_type_name(value)
                ),
            });
            continue;
        }

        if let Some(allowed) = &param.one_of
            && let Some(s) = value.as_str()
            && !allowed.iter().any(|a| a == s)
        {
            diagnostics.push(FieldDiagnostic {
                field: param.name.clone(),
                problem: format!("must be one of {allowed:?}"),
            });
        }

        if let Some(n) = value.as_f64() {
            if let Some(min) = param.min
                && n < min
            {
                diagnostics.push(FieldDiagnostic {
                    field: param.name.clone(),
                    problem: format!("must be >= {min}"),
                });
            }
            if let Some(max) = param.max
                && n > max
            {
                diagnostics.push(FieldDiagnostic {
                    field: param.name.clone(),
                    problem: format!("must be <= {max}"),
                });
            }
        }
    }

    for field in map.keys() {
        if !spec.params.iter().any(|p| &p.name == field) {
            diagnostics.push(FieldDiagnostic {
                field: field.clone(),
                problem: "unknown field".to_owned(),
            });
        }
    }

    diagnostics
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec() -> ToolSpec {
        ToolSpec::new("connect_jack_ports", "Connect two JACK ports")
            .param(ParamSpec::required("source", ParamKind::String))
            .param(ParamSpec::required("sink", ParamKind::String))
            .param(
                ParamSpec::optional("priority", ParamKind::Integer)
                    .min(0.0)
                    .max(10.0),
            )
    }

    #[test]
    fn valid_args_produce_no_diagnostics() {
        let args = json!({"source": "system:capture_1", "sink": "voice_in:in_1"});
        assert!(validate(&spec(), &args).is_empty());
    }

    #[test]
    fn each_offending_field_gets_its_own_diagnostic() {
        let args = json!({"source": 42, "bogus": true});
        let diagnostics = validate(&spec(), &args);
        let fields: Vec<_> = diagnostics.iter().map(|d| d.field.as_str()).collect();
        assert!(fields.contains(&"source"));
        assert!(fields.contains(&"sink"));
        assert!(fields.contains(&"bogus"));
        assert_eq!(diagnostics.len(), 3);
    }

    #[test]
    fn null_args_only_flag_required_fields() {
        let diagnostics = validate(&spec(), &Value::Null);
        assert_eq!(diagnostics.len(), 2);
    }

    #[test]
    fn numeric_constraints_are_enforced() {
        let args = json!({"source": "a", "sink": "b", "priority": 99});
        let diagnostics = validate(&spec(), &args);
        assert_eq!(diagnostics.len(), 1);
        assert_eq!(diagnostics[0].field, "priority");
    }

    #[test]
    fn one_of_constrains_string_values() {
        let spec = ToolSpec::new("t", "")
            .param(ParamSpec::required("direction", ParamKind::String).one_of(["source", "sink"]));
        assert!(validate(&spec, &json!({"direction": "source"})).is_empty());
        let diagnostics = validate(&spec, &json!({"direction": "sideways"}));
        assert_eq!(diagnostics.len(), 1);
    }

    #[test]
    fn integers_pass_where_floats_are_expected() {
        let spec =
            ToolSpec::new("t", "").param(ParamSpec::required("pre_roll", ParamKind::Float));
        assert!(validate(&spec, &json!({"pre_roll": 3})).is_empty());
        assert!(validate(&spec, &json!({"pre_roll": 3.5})).is_empty());
    }
}
