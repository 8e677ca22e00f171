use calmform::value::{FieldValue, FormModel, FormValue};

#[derive(Clone, Debug, PartialEq, calmform::FormModel)]
struct DemoForm {
    #[form(rename = "firstName")]
    first_name: String,
    subscribed: bool,
    nickname: Option<String>,
}

fn main() {
    let fields = DemoForm::fields();
    assert_eq!(fields.first_name(), "firstName");
    assert_eq!(fields.subscribed(), "subscribed");
    assert_eq!(
        DemoForm::field_names(),
        &["firstName", "subscribed", "nickname"]
    );

    let model = DemoForm {
        first_name: "Ivan".to_string(),
        subscribed: true,
        nickname: None,
    };
    let value = FormModel::to_form_value(&model);
    assert_eq!(value.get("firstName"), Some(&FormValue::from("Ivan")));
    assert_eq!(value.get("nickname"), Some(&FormValue::Null));

    let partial = FormValue::from_entries([
        ("firstName", FormValue::from("Petr")),
        ("subscribed", FormValue::from(false)),
    ]);
    let parsed = <DemoForm as FieldValue>::from_form_value(&partial).expect("nickname may be absent");
    assert_eq!(parsed.first_name, "Petr");
    assert_eq!(parsed.nickname, None);
}
