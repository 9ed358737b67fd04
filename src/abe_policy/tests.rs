use crate::{
    abe_policy::{AccessPolicy, AttributeSet, AttributeToken, PolicyDocument},
    error::Error,
};

/// Creates the policy used in tests: riders asking for a verified driver.
pub fn gen_policy() -> Result<AccessPolicy, Error> {
    AccessPolicy::parse("verified")
}

/// Attributes of a driver satisfying [`gen_policy`].
pub fn premium_driver() -> Result<AttributeSet, Error> {
    AttributeSet::from_names(["verified", "premium", "licensed"])
}

/// Attributes of a driver failing [`gen_policy`].
pub fn standard_driver() -> Result<AttributeSet, Error> {
    AttributeSet::from_names(["premium", "licensed"])
}

#[test]
fn test_token_normalization() {
    let a = AttributeToken::new("  Verified ").unwrap();
    let b = AttributeToken::new("verified").unwrap();
    assert_eq!(a, b);
    assert_eq!(
        AttributeToken::new("five   star\tdriver").unwrap(),
        AttributeToken::new("Five Star Driver").unwrap()
    );
    assert_ne!(a, AttributeToken::new("premium").unwrap());
    assert!(matches!(
        AttributeToken::new(" \t "),
        Err(Error::InvalidAttributes(_))
    ));
}

#[test]
fn test_satisfaction() {
    let policy = AccessPolicy::all_of(["verified", "premium"]).unwrap();
    assert!(policy.is_satisfied_by(&AttributeSet::from_names(["verified", "premium"]).unwrap()));
    assert!(policy.is_satisfied_by(&premium_driver().unwrap()));
    assert!(!policy.is_satisfied_by(&standard_driver().unwrap()));
    assert!(!policy.is_satisfied_by(&AttributeSet::default()));
}

#[test]
fn test_invalid_rows() {
    assert!(matches!(
        AccessPolicy::from_rows(vec![]),
        Err(Error::InvalidPolicy(_))
    ));
    let verified = AttributeToken::new("verified").unwrap();
    assert!(matches!(
        AccessPolicy::from_rows(vec![verified, verified]),
        Err(Error::InvalidPolicy(_))
    ));
    assert!(matches!(
        AccessPolicy::all_of(["verified", "VERIFIED"]),
        Err(Error::InvalidPolicy(_))
    ));
}

#[test]
fn test_parse() {
    let policy = AccessPolicy::parse("verified && (premium && licensed)").unwrap();
    assert_eq!(
        policy,
        AccessPolicy::all_of(["verified", "premium", "licensed"]).unwrap()
    );
    assert_eq!(policy.len(), 3);
    assert_eq!(
        policy.rho(1),
        Some(&AttributeToken::new("premium").unwrap())
    );

    assert_eq!(
        AccessPolicy::parse("((five star)) && ev").unwrap(),
        AccessPolicy::all_of(["five star", "ev"]).unwrap()
    );

    assert!(matches!(
        AccessPolicy::parse("verified || premium"),
        Err(Error::UnsupportedOperator(_))
    ));
    assert!(matches!(
        AccessPolicy::parse("verified && (premium"),
        Err(Error::InvalidBooleanExpression(_))
    ));
    assert!(matches!(
        AccessPolicy::parse("verified) && (premium"),
        Err(Error::InvalidBooleanExpression(_))
    ));
    assert!(matches!(
        AccessPolicy::parse("verified && && premium"),
        Err(Error::InvalidBooleanExpression(_))
    ));
    assert!(matches!(
        AccessPolicy::parse("(a)b && c"),
        Err(Error::InvalidBooleanExpression(_))
    ));
    assert!(AccessPolicy::parse("").is_err());
}

#[test]
fn test_policy_document() {
    let policy =
        AccessPolicy::from_json(r#"{"kind":"all_of","rho":{"0":"verified","1":"premium"}}"#)
            .unwrap();
    assert_eq!(policy, AccessPolicy::all_of(["verified", "premium"]).unwrap());

    let with_matrix = AccessPolicy::from_json(
        r#"{"kind":"all_of","rho":{"0":"verified","1":"premium"},"matrix":[[1,1],[0,-1]]}"#,
    )
    .unwrap();
    assert_eq!(with_matrix, policy);

    // sparse rows
    assert!(matches!(
        AccessPolicy::from_json(r#"{"kind":"all_of","rho":{"0":"verified","2":"premium"}}"#),
        Err(Error::InvalidPolicy(_))
    ));
    // matrix and rho disagree
    assert!(matches!(
        AccessPolicy::from_json(
            r#"{"kind":"all_of","rho":{"0":"verified"},"matrix":[[1],[1]]}"#
        ),
        Err(Error::InvalidPolicy(_))
    ));
    assert!(matches!(
        AccessPolicy::from_json(r#"{"kind":"any_of","rho":{"0":"verified"}}"#),
        Err(Error::InvalidPolicy(_))
    ));
    assert!(matches!(
        AccessPolicy::from_json(r#"{"kind":"all_of","rho":{}}"#),
        Err(Error::InvalidPolicy(_))
    ));

    let document = PolicyDocument::AllOf {
        rho: [("0".to_string(), "verified".to_string())]
            .into_iter()
            .collect(),
        matrix: None,
    };
    let json = serde_json::to_string(&document).unwrap();
    assert_eq!(json, r#"{"kind":"all_of","rho":{"0":"verified"}}"#);
    assert_eq!(
        AccessPolicy::from_json(&json).unwrap(),
        AccessPolicy::all_of(["verified"]).unwrap()
    );

    // rows are ordered numerically, not as strings
    let names = ["a", "b", "c", "d", "e", "f", "g", "h", "i", "j", "k"];
    let rho = names
        .iter()
        .enumerate()
        .map(|(row, name)| format!("\"{row}\":\"{name}\""))
        .collect::<Vec<_>>()
        .join(",");
    assert_eq!(
        AccessPolicy::from_json(&format!(r#"{{"kind":"all_of","rho":{{{rho}}}}}"#)).unwrap(),
        AccessPolicy::all_of(names).unwrap()
    );
    assert!(matches!(
        AccessPolicy::from_json(r#"{"kind":"all_of","rho":{"first":"verified"}}"#),
        Err(Error::InvalidPolicy(_))
    ));
}

#[test]
fn test_digest() {
    let a = AccessPolicy::all_of(["verified", "premium"]).unwrap();
    let b = AccessPolicy::all_of(["premium", "verified"]).unwrap();
    assert_eq!(a.digest(), a.clone().digest());
    assert_ne!(a.digest(), b.digest());
    assert_eq!(a.required_attributes(), b.required_attributes());
}
